//! Docker-backed [`SandboxAdapter`] implementation.
//!
//! Containers are created with no host networking, a read-only root
//! filesystem, dropped capabilities, and an explicit resource ceiling — the
//! sandboxing policy required by the adapter contract. `Tty: true` merges
//! stdout/stderr the way a real terminal would.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, RemoveContainerOptions,
    ResizeContainerTtyOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::io::StreamReader;
use tracing::warn;

use super::{Handle, SandboxAdapter, SandboxError, SandboxIo, SizeHint};

/// Per-language image + default command, resolved from configuration.
#[derive(Debug, Clone)]
pub struct LanguageImage {
    pub image: String,
    pub cmd: Vec<String>,
}

/// Resource ceiling applied to every container this adapter creates.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub cpu_nanos: i64,
    pub memory_bytes: i64,
}

pub struct DockerAdapter {
    docker: Docker,
    images: HashMap<String, LanguageImage>,
    limits: ResourceLimits,
}

impl DockerAdapter {
    /// Connect using the adapter library's platform default (typically the
    /// local Unix socket), or the configured `docker_host` override.
    pub fn connect(
        docker_host: Option<&str>,
        images: HashMap<String, LanguageImage>,
        limits: ResourceLimits,
    ) -> Result<Self, SandboxError> {
        let docker = match docker_host {
            Some(host) => Docker::connect_with_http(host, 30, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    warn!("failed to connect to docker host {host}: {e}");
                    SandboxError::Unavailable
                })?,
            None => Docker::connect_with_local_defaults().map_err(|e| {
                warn!("failed to connect to local docker socket: {e}");
                SandboxError::Unavailable
            })?,
        };
        Ok(Self {
            docker,
            images,
            limits,
        })
    }

    fn classify(err: &bollard::errors::Error) -> SandboxError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => SandboxError::ImageMissing,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 403, ..
            } => SandboxError::Permission,
            _ => SandboxError::Internal,
        }
    }
}

#[async_trait]
impl SandboxAdapter for DockerAdapter {
    async fn create_interactive(
        &self,
        language: &str,
        size: SizeHint,
    ) -> Result<(Handle, Box<dyn SandboxIo>), SandboxError> {
        let lang = self.images.get(language).ok_or(SandboxError::ImageMissing)?;

        let host_config = HostConfig {
            network_mode: Some("none".into()),
            readonly_rootfs: Some(true),
            auto_remove: Some(true),
            cap_drop: Some(vec!["ALL".into()]),
            memory: Some(self.limits.memory_bytes),
            nano_cpus: Some(self.limits.cpu_nanos),
            tmpfs: Some(HashMap::from([("/tmp".to_string(), String::new())])),
            ..Default::default()
        };

        let config = Config {
            image: Some(lang.image.clone()),
            cmd: Some(lang.cmd.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            user: Some("nobody".to_string()),
            env: Some(vec!["TERM=xterm".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container::<String, String>(None, config)
            .await
            .map_err(|e| Self::classify(&e))?;
        let id = created.id;

        self.docker
            .start_container::<String>(&id, None)
            .await
            .map_err(|e| Self::classify(&e))?;

        if size.cols > 0 && size.rows > 0 {
            let _ = self
                .docker
                .resize_container_tty(
                    &id,
                    ResizeContainerTtyOptions {
                        height: size.rows,
                        width: size.cols,
                    },
                )
                .await;
        }

        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(
                &id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Self::classify(&e))?;

        let io = DockerIo::new(output, input);
        Ok((Handle(id), Box::new(io)))
    }

    async fn resize(&self, handle: &Handle, cols: u16, rows: u16) -> Result<(), SandboxError> {
        self.docker
            .resize_container_tty(
                &handle.0,
                ResizeContainerTtyOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| Self::classify(&e))
    }

    async fn stop(&self, handle: &Handle, grace_ms: u64) -> Result<(), SandboxError> {
        self.docker
            .stop_container(
                &handle.0,
                Some(StopContainerOptions {
                    t: (grace_ms / 1000).max(1) as i64,
                }),
            )
            .await
            .map_err(|e| Self::classify(&e))
    }

    async fn remove(&self, handle: &Handle) -> Result<(), SandboxError> {
        match self
            .docker
            .remove_container(
                &handle.0,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone via auto-remove — not an error from the broker's view.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(Self::classify(&e)),
        }
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        self.docker.ping().await.map(|_| ()).map_err(|e| Self::classify(&e))
    }
}

/// Adapts bollard's attach-result pair (a `LogOutput` stream plus an
/// `AsyncWrite` sink) into a single `AsyncRead + AsyncWrite` the rest of the
/// broker can treat as an ordinary duplex stream.
struct DockerIo {
    reader: StreamReader<
        Pin<Box<dyn futures_util::Stream<Item = io::Result<Bytes>> + Send>>,
        Bytes,
    >,
    writer: Pin<Box<dyn AsyncWrite + Send>>,
}

impl DockerIo {
    fn new(
        output: impl futures_util::Stream<Item = Result<bollard::container::LogOutput, bollard::errors::Error>>
            + Send
            + 'static,
        input: Pin<Box<dyn AsyncWrite + Send>>,
    ) -> Self {
        let bytes_stream = output.map(|item| {
            item.map(|log| match log {
                bollard::container::LogOutput::StdOut { message }
                | bollard::container::LogOutput::StdErr { message }
                | bollard::container::LogOutput::Console { message }
                | bollard::container::LogOutput::StdIn { message } => message,
            })
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        });
        Self {
            reader: StreamReader::new(Box::pin(bytes_stream)),
            writer: input,
        }
    }
}

impl AsyncRead for DockerIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for DockerIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
