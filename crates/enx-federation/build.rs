fn main() {
    println!("cargo:rerun-if-changed=proto/federation.proto");
    build_proto();
}

fn build_proto() {
    // prost-build locates protoc through PROTOC; point it at the vendored
    // binary so builds do not depend on a system install.
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc");
    unsafe { std::env::set_var("PROTOC", &protoc) };

    let mut config = prost_build::Config::new();
    config.protoc_arg("--experimental_allow_proto3_optional");
    let out_dir = std::env::var("OUT_DIR").unwrap();
    tonic_build::configure()
        .file_descriptor_set_path(format!("{out_dir}/federation_descriptor.bin"))
        .compile_protos_with_config(config, &["proto/federation.proto"], &["proto"])
        .unwrap();
}
