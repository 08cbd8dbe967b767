// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

fn main() -> std::io::Result<()> {
    let proto_root = "proto";

    let protos = [
        "google/rpc/code.proto",
        "google/rpc/status.proto",
        "google/bytestream/bytestream.proto",
        "build/bazel/remote/execution/v2/remote_execution.proto",
        "build/bazel/remote/asset/v1/remote_asset.proto",
        "build/buildgrid/local_cas.proto",
        "buildstream/artifact.proto",
    ]
    .map(|relative| format!("{proto_root}/{relative}"));

    let mut config = prost_build::Config::new();
    // Generated message fields holding blob payloads come back as `bytes::Bytes`
    // rather than `Vec<u8>`, so they can be cheaply shared between the batch
    // engine and the byte-stream path without copying.
    config.bytes(["."]);

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_with_config(config, &protos, &[proto_root])?;

    for proto in &protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    Ok(())
}
