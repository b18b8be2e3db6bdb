#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use runner_proto::runner::v1 as pb;
use runner_proto::runner::v1::runner_service_client::RunnerServiceClient;
use runner_server::auth::BearerAuth;
use runner_server::service::{RunnerServiceImpl, ServiceConfig};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Status, Streaming};

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Result<Self> {
        Self::start_with_auth(BearerAuth::default()).await
    }

    pub async fn start_with_auth(auth: BearerAuth) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let svc = RunnerServiceImpl::new(ServiceConfig {
            ring_buffer_size: 64 << 10,
            chunk_size: 4 << 10,
            drain_grace: Duration::from_secs(2),
        })
        .into_server(4 << 20);

        tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(InterceptedService::new(svc, auth))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
        })
    }

    pub async fn channel(&self) -> Result<Channel> {
        Ok(Endpoint::from_shared(format!("http://{}", self.addr))?
            .connect()
            .await?)
    }

    pub async fn client(&self) -> Result<RunnerServiceClient<Channel>> {
        Ok(RunnerServiceClient::new(self.channel().await?))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// An open `Execute` call: the request sender stays alive until dropped.
pub struct Call {
    pub requests: mpsc::Sender<pb::ExecuteRequest>,
    pub responses: Streaming<pb::ExecuteResponse>,
}

pub async fn open_call(
    client: &mut RunnerServiceClient<Channel>,
    first: pb::ExecuteRequest,
) -> Result<Call, Status> {
    let (tx, rx) = mpsc::channel(8);
    tx.send(first)
        .await
        .map_err(|_| Status::internal("request channel closed"))?;
    let responses = client.execute(ReceiverStream::new(rx)).await?.into_inner();
    Ok(Call {
        requests: tx,
        responses,
    })
}

#[derive(Debug, Default)]
pub struct Collected {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_codes: Vec<i32>,
}

impl Collected {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Read responses until the server ends the call.
pub async fn collect(responses: &mut Streaming<pb::ExecuteResponse>) -> Result<Collected, Status> {
    let mut out = Collected::default();
    while let Some(resp) = responses.next().await {
        let resp = resp?;
        out.stdout.extend_from_slice(&resp.stdout_data);
        out.stderr.extend_from_slice(&resp.stderr_data);
        if let Some(code) = resp.exit_code {
            out.exit_codes.push(code);
        }
    }
    Ok(out)
}

pub async fn run(
    client: &mut RunnerServiceClient<Channel>,
    first: pb::ExecuteRequest,
) -> Result<Collected, Status> {
    let mut call = open_call(client, first).await?;
    tokio::time::timeout(Duration::from_secs(20), collect(&mut call.responses))
        .await
        .map_err(|_| Status::deadline_exceeded("call did not finish"))?
}

pub fn shell(commands: &[&str]) -> pb::ExecuteRequest {
    pb::ExecuteRequest {
        program_name: "/bin/sh".to_string(),
        commands: commands.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    }
}

pub fn program(name: &str, args: &[&str]) -> pb::ExecuteRequest {
    pb::ExecuteRequest {
        program_name: name.to_string(),
        arguments: args.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    }
}
