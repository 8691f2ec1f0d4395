//! Build script for remsh-proto
//!
//! Compiles protobuf definitions using tonic-prost-build.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = "../../proto";

    let protos = ["remsh/v1/remote.proto"];

    let proto_paths: Vec<_> = protos
        .iter()
        .map(|p| format!("{proto_root}/{p}"))
        .collect();

    for path in &proto_paths {
        println!("cargo:rerun-if-changed={path}");
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&proto_paths, &[proto_root.to_string()])?;

    Ok(())
}
