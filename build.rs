fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the bundled protoc unless one is configured explicitly.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    println!("cargo:rerun-if-changed=proto/gfs.proto");
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/gfs.proto"], &["proto"])?;
    Ok(())
}
