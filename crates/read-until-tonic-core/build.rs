/// Generates the gRPC client bindings for `proto/read_until.proto`.
///
/// `ReadData.raw_data` is generated as `bytes::Bytes` rather than `Vec<u8>`,
/// so a chunk's signal moves from the decoded frame into the cache without a
/// copy.
///
/// Only the client half is generated; this workspace never serves the stream.
///
/// Generated code is included with:
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("read_until");
/// }
/// ```
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("read_until_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    config
        .bytes([".read_until.GetLiveReadsResponse.ReadData.raw_data"])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .build_server(false)
        .compile_with_config(config, &["proto/read_until.proto"], &["proto"])
        .unwrap();
}
