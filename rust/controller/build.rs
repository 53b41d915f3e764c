fn main() {
    let proto_file = "../../proto/switch_control.proto";
    let proto_dir = "../../proto";

    // Rerun if proto file changes
    println!("cargo:rerun-if-changed={}", proto_file);

    // Fall back to the bundled protoc when none is installed
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().expect("Failed to locate bundled protoc");
        std::env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_file], &[proto_dir])
        .expect("Failed to compile switch_control.proto");
}
