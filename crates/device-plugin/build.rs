fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/deviceplugin/v1beta1/deviceplugin.proto");

    let builder = tonic_build::configure()
        .format(true)
        .build_client(true)
        .build_server(true);

    builder.compile(
        &["proto/deviceplugin/v1beta1/deviceplugin.proto"],
        &["proto/deviceplugin/v1beta1"],
    )?;
    Ok(())
}
