//! Generates the `agenthost.AgentHost` gRPC service stubs.
//!
//! Messages are hand-written prost structs in `src/grpc/proto.rs`, so the
//! service is described with tonic-build's manual builder and no `protoc`
//! is required at build time.

fn method(
    name: &str,
    route: &str,
    input: &str,
    output: &str,
) -> tonic_build::manual::MethodBuilder {
    tonic_build::manual::Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::grpc::proto::{}", input))
        .output_type(format!("crate::grpc::proto::{}", output))
        .codec_path("tonic::codec::ProstCodec")
}

fn main() {
    let service = tonic_build::manual::Service::builder()
        .name("AgentHost")
        .package("agenthost")
        .method(method("is_alive", "IsAlive", "Empty", "StatusResponse").build())
        .method(method("stop", "Stop", "Empty", "StatusResponse").build())
        .method(
            method("create_object", "CreateObject", "CreateObjectRequest", "ObjectIdResponse")
                .build(),
        )
        .method(
            method("delete_object", "DeleteObject", "ObjectIdRequest", "StatusResponse")
                .build(),
        )
        .method(
            method("delete_all_objects", "DeleteAllObjects", "Empty", "DeleteAllResponse")
                .build(),
        )
        .method(
            method("clone_object", "CloneObject", "ObjectIdRequest", "ObjectIdResponse")
                .build(),
        )
        .method(method("list_objects", "ListObjects", "Empty", "ListObjectsResponse").build())
        .method(method("server_info", "ServerInfo", "Empty", "ServerInfoResponse").build())
        .method(method("set_config", "SetConfig", "SetConfigRequest", "SetConfigResponse").build())
        .method(method("get_memory", "GetMemory", "ObjectIdRequest", "MemoryResponse").build())
        .method(method("call_function", "CallFunction", "CallRequest", "CallResponse").build())
        .method(method("fetch_result", "FetchResult", "FetchRequest", "FetchResponse").build())
        .method(
            method("download_file", "DownloadFile", "DownloadRequest", "FileChunk")
                .server_streaming()
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}
