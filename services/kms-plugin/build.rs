fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Kubernetes KMS v1beta1 API (legacy)
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/v1beta1/api.proto"], &["proto"])?;

    // Kubernetes KMS v2 API; the client is used by the health check
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/v2/api.proto"], &["proto"])?;

    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    println!("cargo:rerun-if-env-changed=BUILD_DATE");

    Ok(())
}
