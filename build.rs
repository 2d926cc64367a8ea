use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_dir = PathBuf::from("proto");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=proto/");

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Only the server side is generated; web handlers bring their own client stubs.
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(
            &[proto_dir.join("ratekeeper/v1/ratekeeper.proto")],
            &[&proto_dir],
        )?;

    Ok(())
}
