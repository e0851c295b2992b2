//! gRPC implementation of the client's [`Transport`] seam.
//!
//! Every session dials a fresh channel and opens one `GetLiveReads` call. The
//! call itself runs on its own task: tonic only resolves a bidirectional call
//! once the server has sent response headers, and a server may hold those back
//! until it has seen the setup request. The sink is usable immediately and the
//! source waits for the call on its first receive.

use super::config::ConnectionConfig;
use anyhow::Context;
use read_until::{InboundMessage, InboundSource, OutboundMessage, OutboundSink, Transport};
use read_until_tonic_core::{
    Error,
    proto::{GetLiveReadsRequest, GetLiveReadsResponse, data_service_client::DataServiceClient},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    Status, Streaming,
    codec::CompressionEncoding,
    transport::{Channel, Endpoint},
};

pub struct GrpcTransport {
    endpoint: Endpoint,
    compression: Option<CompressionEncoding>,
    request_buffer_size: usize,
}

impl GrpcTransport {
    pub fn new(config: &ConnectionConfig) -> anyhow::Result<Self> {
        let endpoint = Endpoint::from_shared(config.server_addr.clone())
            .with_context(|| format!("invalid server address '{}'", config.server_addr))?
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true)
            .http2_adaptive_window(true);

        Ok(Self {
            endpoint,
            compression: config.compression,
            request_buffer_size: config.request_buffer_size,
        })
    }

    fn client(&self, channel: Channel) -> DataServiceClient<Channel> {
        let client = DataServiceClient::new(channel).max_decoding_message_size(usize::MAX);
        match self.compression {
            Some(encoding) => client
                .send_compressed(encoding)
                .accept_compressed(encoding),
            None => client,
        }
    }
}

impl Transport for GrpcTransport {
    type Sink = GrpcSink;
    type Source = GrpcSource;

    async fn connect(&self) -> read_until::Result<(GrpcSink, GrpcSource)> {
        #[cfg(feature = "tracing")]
        tracing::debug!("Dialing {}", self.endpoint.uri());

        let channel = self.endpoint.connect().await.map_err(|e| Error::Connect {
            context: format!("{}: {e}", self.endpoint.uri()),
        })?;
        let mut client = self.client(channel);

        let (tx, rx) = mpsc::channel(self.request_buffer_size);
        let call = tokio::spawn(async move {
            client
                .get_live_reads(ReceiverStream::new(rx))
                .await
                .map(tonic::Response::into_inner)
        });

        Ok((
            GrpcSink { requests: tx },
            GrpcSource {
                state: SourceState::Pending(call),
            },
        ))
    }
}

/// Request half of a `GetLiveReads` call.
pub struct GrpcSink {
    requests: mpsc::Sender<GetLiveReadsRequest>,
}

impl OutboundSink for GrpcSink {
    async fn send(&mut self, message: OutboundMessage) -> read_until::Result<()> {
        self.requests.send(message.into()).await.map_err(|_| {
            read_until::Error::from(Error::Connect {
                context: "request stream closed".to_string(),
            })
        })
    }
}

enum SourceState {
    /// The call has not produced response headers yet.
    Pending(JoinHandle<Result<Streaming<GetLiveReadsResponse>, Status>>),
    Open(Streaming<GetLiveReadsResponse>),
    Closed,
}

/// Response half of a `GetLiveReads` call.
pub struct GrpcSource {
    state: SourceState,
}

impl InboundSource for GrpcSource {
    async fn receive(&mut self) -> read_until::Result<Option<InboundMessage>> {
        if let SourceState::Pending(call) = &mut self.state {
            let joined = call.await;
            self.state = SourceState::Closed;
            let stream = joined
                .map_err(|e| Error::Connect {
                    context: format!("call task failed: {e}"),
                })?
                .map_err(Error::from)?;
            self.state = SourceState::Open(stream);
        }

        let SourceState::Open(stream) = &mut self.state else {
            return Ok(None);
        };
        match stream.message().await {
            Ok(Some(response)) => Ok(Some(InboundMessage::try_from(response)?)),
            Ok(None) => Ok(None),
            Err(status) => Err(Error::from(status).into()),
        }
    }
}

impl Drop for GrpcSource {
    fn drop(&mut self) {
        if let SourceState::Pending(call) = &self.state {
            call.abort();
        }
    }
}
