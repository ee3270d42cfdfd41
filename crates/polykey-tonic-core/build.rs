/// Generates the gRPC client and server bindings for the `polykey.v2` package.
///
/// The schema is described directly as a [`FileDescriptorSet`] and handed to
/// `tonic-prost-build`, so building the crate does not need `protoc` on the
/// host. The same descriptor set is encoded into `OUT_DIR` for the reflection
/// service and the host's method introspection.
///
/// # Schema
///
/// ```proto
/// syntax = "proto3";
/// package polykey.v2;
///
/// service PolykeyService {
///   rpc CreateKey(CreateKeyRequest) returns (CreateKeyResponse);
///   rpc GetKey(GetKeyRequest) returns (GetKeyResponse);
/// }
///
/// message CreateKeyRequest  { string description = 1; }
/// message CreateKeyResponse { string key_id = 1; }
/// message GetKeyRequest     { string key_id = 1; }
/// message GetKeyResponse    { string key_id = 1; string description = 2; uint64 created_at_ms = 3; }
/// ```
///
/// # Output
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("polykey.v2");
/// }
/// ```
use prost::Message;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};
use std::env;
use std::path::PathBuf;

const PACKAGE: &str = "polykey.v2";

fn field(name: &str, json_name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        json_name: Some(json_name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        ..Default::default()
    }
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: fields,
        ..Default::default()
    }
}

fn unary(name: &str, input: &str, output: &str) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(format!(".{PACKAGE}.{input}")),
        output_type: Some(format!(".{PACKAGE}.{output}")),
        client_streaming: Some(false),
        server_streaming: Some(false),
        ..Default::default()
    }
}

fn polykey_file() -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some("polykey/v2/polykey.proto".to_string()),
        package: Some(PACKAGE.to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            message(
                "CreateKeyRequest",
                vec![field("description", "description", 1, Type::String)],
            ),
            message(
                "CreateKeyResponse",
                vec![field("key_id", "keyId", 1, Type::String)],
            ),
            message(
                "GetKeyRequest",
                vec![field("key_id", "keyId", 1, Type::String)],
            ),
            message(
                "GetKeyResponse",
                vec![
                    field("key_id", "keyId", 1, Type::String),
                    field("description", "description", 2, Type::String),
                    field("created_at_ms", "createdAtMs", 3, Type::Uint64),
                ],
            ),
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("PolykeyService".to_string()),
            method: vec![
                unary("CreateKey", "CreateKeyRequest", "CreateKeyResponse"),
                unary("GetKey", "GetKeyRequest", "GetKeyResponse"),
            ],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("polykey_descriptor.bin");

    let fds = FileDescriptorSet {
        file: vec![polykey_file()],
    };
    std::fs::write(&descriptor_path, fds.encode_to_vec()).unwrap();

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(fds)
        .unwrap();
}
