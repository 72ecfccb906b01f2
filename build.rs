fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/cni.proto");

    // Point prost/tonic at a vendored protoc binary so the build does not
    // depend on a system-installed protobuf compiler.
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }

    // Compile the CNI protocol definition
    tonic_build::compile_protos("proto/cni.proto")?;

    Ok(())
}
