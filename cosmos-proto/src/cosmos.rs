/// The envelope for every message sent by an agent.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentMessage {
    /// The hostname of the sending agent.
    #[prost(string, tag = "1")]
    pub hostname: ::prost::alloc::string::String,
    /// Wall-clock seconds at which the message was built.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(oneof = "agent_message::Payload", tags = "10, 11, 12, 13, 14")]
    pub payload: ::core::option::Option<agent_message::Payload>,
}
/// Nested message and enum types in `AgentMessage`.
pub mod agent_message {
    #[allow(clippy::derive_partial_eq_without_eq)]
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "11")]
        ComponentStatus(super::ComponentStatus),
        #[prost(message, tag = "12")]
        HealthResult(super::HealthCheckResult),
        #[prost(message, tag = "13")]
        DeploymentResult(super::DeploymentResult),
        #[prost(message, tag = "14")]
        LogChunk(super::LogChunk),
    }
}
/// A periodic liveness report bundling the status of every local component.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(string, tag = "1")]
    pub agent_version: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub component_statuses: ::prost::alloc::vec::Vec<ComponentStatus>,
}
/// The runtime status of a single component on an agent.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComponentStatus {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// One of: unknown, running, stopped, failed.
    #[prost(string, tag = "2")]
    pub status: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub message: ::prost::alloc::string::String,
    #[prost(int32, tag = "4")]
    pub pid: i32,
    #[prost(int32, tag = "5")]
    pub restart_count: i32,
    /// Seconds timestamp of the last successful start, 0 when never started.
    #[prost(int64, tag = "6")]
    pub last_started_at: i64,
}
/// The outcome of a single health check probe.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckResult {
    #[prost(string, tag = "1")]
    pub component_name: ::prost::alloc::string::String,
    /// One of: http, tcp, process.
    #[prost(string, tag = "2")]
    pub check_type: ::prost::alloc::string::String,
    /// One of: success, failure.
    #[prost(string, tag = "3")]
    pub result: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub message: ::prost::alloc::string::String,
    #[prost(int64, tag = "5")]
    pub timestamp: i64,
}
/// The outcome of a deployment-related operation on an agent.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeploymentResult {
    #[prost(string, tag = "1")]
    pub component_name: ::prost::alloc::string::String,
    /// One of: deploy, deploy-program, deploy-script, remove, restart.
    #[prost(string, tag = "2")]
    pub operation: ::prost::alloc::string::String,
    /// One of: received, started, running, success, failure.
    #[prost(string, tag = "3")]
    pub result: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub message: ::prost::alloc::string::String,
    #[prost(int64, tag = "5")]
    pub timestamp: i64,
}
/// A chunk of captured component output.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogChunk {
    #[prost(string, tag = "1")]
    pub component_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub log_data: ::prost::alloc::string::String,
    /// Byte offset of this chunk within the component's log.
    #[prost(int64, tag = "3")]
    pub offset: i64,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
}
/// The envelope for every command sent by the controller.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerMessage {
    #[prost(oneof = "controller_message::Payload", tags = "1, 2, 3, 4")]
    pub payload: ::core::option::Option<controller_message::Payload>,
}
/// Nested message and enum types in `ControllerMessage`.
pub mod controller_message {
    #[allow(clippy::derive_partial_eq_without_eq)]
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Deployment(super::ComponentDeployment),
        #[prost(message, tag = "2")]
        Removal(super::ComponentRemoval),
        #[prost(message, tag = "3")]
        HealthConfig(super::HealthCheckConfig),
        #[prost(message, tag = "4")]
        Ack(super::Acknowledgment),
    }
}
/// A command instructing an agent to materialize & run a component.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComponentDeployment {
    #[prost(string, tag = "1")]
    pub component_name: ::prost::alloc::string::String,
    /// One of: script, program.
    #[prost(string, tag = "2")]
    pub component_type: ::prost::alloc::string::String,
    /// Hex SHA-256 of the component content; the artifact identity.
    #[prost(string, tag = "3")]
    pub hash: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub content_url: ::prost::alloc::string::String,
    /// One of: plain, tar.gz, tgz, zip. Empty means plain.
    #[prost(string, tag = "5")]
    pub content_url_encoding: ::prost::alloc::string::String,
    /// Inline content for scripts.
    #[prost(string, tag = "6")]
    pub content: ::prost::alloc::string::String,
    /// Managed components are supervised & restarted; unmanaged run once.
    #[prost(bool, tag = "7")]
    pub managed: bool,
    #[prost(map = "string, string", tag = "8")]
    pub env: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    #[prost(string, repeated, tag = "9")]
    pub args: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "10")]
    pub health_check: ::core::option::Option<HealthCheckConfig>,
}
/// A command instructing an agent to stop & delete a component.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComponentRemoval {
    #[prost(string, tag = "1")]
    pub component_name: ::prost::alloc::string::String,
}
/// Health check configuration for one component.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckConfig {
    #[prost(string, tag = "1")]
    pub component_name: ::prost::alloc::string::String,
    /// One of: http, tcp, process.
    #[prost(string, tag = "2")]
    pub r#type: ::prost::alloc::string::String,
    /// Probe target; ignored for process checks.
    #[prost(string, tag = "3")]
    pub endpoint: ::prost::alloc::string::String,
    #[prost(int32, tag = "4")]
    pub interval_seconds: i32,
    #[prost(int32, tag = "5")]
    pub timeout_seconds: i32,
    #[prost(int32, tag = "6")]
    pub retries: i32,
}
/// A generic acknowledgment from the controller.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Acknowledgment {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
}
/// Generated client implementations.
pub mod cosmos_controller_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;
    /// The Cosmos control plane service.
    ///
    /// A single long-lived bidirectional stream carries all traffic between an
    /// agent and the controller. Agents send heartbeats, status updates and
    /// results; the controller sends deployment, removal and health check
    /// commands.
    #[derive(Debug, Clone)]
    pub struct CosmosControllerClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl CosmosControllerClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> CosmosControllerClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }
        pub fn with_interceptor<F>(
            inner: T,
            interceptor: F,
        ) -> CosmosControllerClient<InterceptedService<T, F>>
        where
            F: tonic::service::Interceptor,
            T::ResponseBody: Default,
            T: tonic::codegen::Service<
                http::Request<tonic::body::BoxBody>,
                Response = http::Response<
                    <T as tonic::client::GrpcService<tonic::body::BoxBody>>::ResponseBody,
                >,
            >,
            <T as tonic::codegen::Service<
                http::Request<tonic::body::BoxBody>,
            >>::Error: Into<StdError> + Send + Sync,
        {
            CosmosControllerClient::new(InterceptedService::new(inner, interceptor))
        }
        /// Compress requests with the given encoding.
        ///
        /// This requires the server to support it otherwise it might respond with an
        /// error.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.send_compressed(encoding);
            self
        }
        /// Enable decompressing responses.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.accept_compressed(encoding);
            self
        }
        /// Limits the maximum size of a decoded message.
        ///
        /// Default: `4MB`
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_decoding_message_size(limit);
            self
        }
        /// Limits the maximum size of an encoded message.
        ///
        /// Default: `usize::MAX`
        #[must_use]
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_encoding_message_size(limit);
            self
        }
        /// Open the control stream for one agent.
        pub async fn stream_agent_messages(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::AgentMessage>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::ControllerMessage>>,
            tonic::Status,
        > {
            self.inner
                .ready()
                .await
                .map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("Service was not ready: {}", e.into()),
                    )
                })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cosmos.CosmosController/StreamAgentMessages",
            );
            let mut req = request.into_streaming_request();
            req.extensions_mut()
                .insert(
                    GrpcMethod::new("cosmos.CosmosController", "StreamAgentMessages"),
                );
            self.inner.streaming(req, path, codec).await
        }
    }
}
/// Generated server implementations.
pub mod cosmos_controller_server {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::*;
    /// Generated trait containing gRPC methods that should be implemented for use with CosmosControllerServer.
    #[async_trait]
    pub trait CosmosController: Send + Sync + 'static {
        /// Server streaming response type for the StreamAgentMessages method.
        type StreamAgentMessagesStream: tonic::codegen::tokio_stream::Stream<
                Item = std::result::Result<super::ControllerMessage, tonic::Status>,
            >
            + Send
            + 'static;
        /// Open the control stream for one agent.
        async fn stream_agent_messages(
            &self,
            request: tonic::Request<tonic::Streaming<super::AgentMessage>>,
        ) -> std::result::Result<
            tonic::Response<Self::StreamAgentMessagesStream>,
            tonic::Status,
        >;
    }
    /// The Cosmos control plane service.
    ///
    /// A single long-lived bidirectional stream carries all traffic between an
    /// agent and the controller. Agents send heartbeats, status updates and
    /// results; the controller sends deployment, removal and health check
    /// commands.
    #[derive(Debug)]
    pub struct CosmosControllerServer<T: CosmosController> {
        inner: _Inner<T>,
        accept_compression_encodings: EnabledCompressionEncodings,
        send_compression_encodings: EnabledCompressionEncodings,
        max_decoding_message_size: Option<usize>,
        max_encoding_message_size: Option<usize>,
    }
    struct _Inner<T>(Arc<T>);
    impl<T: CosmosController> CosmosControllerServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }
        pub fn from_arc(inner: Arc<T>) -> Self {
            let inner = _Inner(inner);
            Self {
                inner,
                accept_compression_encodings: Default::default(),
                send_compression_encodings: Default::default(),
                max_decoding_message_size: None,
                max_encoding_message_size: None,
            }
        }
        pub fn with_interceptor<F>(
            inner: T,
            interceptor: F,
        ) -> InterceptedService<Self, F>
        where
            F: tonic::service::Interceptor,
        {
            InterceptedService::new(Self::new(inner), interceptor)
        }
        /// Enable decompressing requests with the given encoding.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.accept_compression_encodings.enable(encoding);
            self
        }
        /// Compress responses with the given encoding, if the client supports it.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.send_compression_encodings.enable(encoding);
            self
        }
        /// Limits the maximum size of a decoded message.
        ///
        /// Default: `4MB`
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.max_decoding_message_size = Some(limit);
            self
        }
        /// Limits the maximum size of an encoded message.
        ///
        /// Default: `usize::MAX`
        #[must_use]
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.max_encoding_message_size = Some(limit);
            self
        }
    }
    impl<T, B> tonic::codegen::Service<http::Request<B>> for CosmosControllerServer<T>
    where
        T: CosmosController,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/cosmos.CosmosController/StreamAgentMessages" => {
                    #[allow(non_camel_case_types)]
                    struct StreamAgentMessagesSvc<T: CosmosController>(pub Arc<T>);
                    impl<
                        T: CosmosController,
                    > tonic::server::StreamingService<super::AgentMessage>
                    for StreamAgentMessagesSvc<T> {
                        type Response = super::ControllerMessage;
                        type ResponseStream = T::StreamAgentMessagesStream;
                        type Future = BoxFuture<
                            tonic::Response<Self::ResponseStream>,
                            tonic::Status,
                        >;
                        fn call(
                            &mut self,
                            request: tonic::Request<tonic::Streaming<super::AgentMessage>>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move {
                                <T as CosmosController>::stream_agent_messages(
                                        &inner,
                                        request,
                                    )
                                    .await
                            };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let max_decoding_message_size = self.max_decoding_message_size;
                    let max_encoding_message_size = self.max_encoding_message_size;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let inner = inner.0;
                        let method = StreamAgentMessagesSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec)
                            .apply_compression_config(
                                accept_compression_encodings,
                                send_compression_encodings,
                            )
                            .apply_max_message_size_config(
                                max_decoding_message_size,
                                max_encoding_message_size,
                            );
                        let res = grpc.streaming(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => {
                    Box::pin(async move {
                        Ok(
                            http::Response::builder()
                                .status(200)
                                .header("grpc-status", "12")
                                .header("content-type", "application/grpc")
                                .body(empty_body())
                                .unwrap(),
                        )
                    })
                }
            }
        }
    }
    impl<T: CosmosController> Clone for CosmosControllerServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self {
                inner,
                accept_compression_encodings: self.accept_compression_encodings,
                send_compression_encodings: self.send_compression_encodings,
                max_decoding_message_size: self.max_decoding_message_size,
                max_encoding_message_size: self.max_encoding_message_size,
            }
        }
    }
    impl<T: CosmosController> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(Arc::clone(&self.0))
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: CosmosController> tonic::server::NamedService
    for CosmosControllerServer<T> {
        const NAME: &'static str = "cosmos.CosmosController";
    }
}
