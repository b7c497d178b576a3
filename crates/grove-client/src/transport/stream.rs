//! Byte-stream transports: the git daemon over TCP, and `ssh` child processes.

use super::{FetchResponse, Session, Transport};
use crate::endpoint::Endpoint;
use crate::{Error, Result};
use async_trait::async_trait;
use grove_git::{
    decode_push_report, decode_upload_response, encode_push_request, encode_upload_request,
    Advertisement, AsyncPktLineReader, Command, FetchRequest, PktLine, PushReport, Service,
};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command as Process};
use tracing::debug;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Speaks the v0 protocol over a raw byte stream.
///
/// A stream carries exactly one request after the advertisement. Sessions
/// reconnect transparently for later requests.
#[derive(Debug, Clone)]
pub struct StreamTransport {
    endpoint: Endpoint,
    agent: String,
}

impl StreamTransport {
    /// Creates a transport for a `git://` or ssh endpoint.
    pub fn new(endpoint: Endpoint, user_agent: &str) -> Self {
        Self {
            endpoint,
            agent: user_agent.to_string(),
        }
    }

    async fn connect(&self, service: Service) -> Result<(Stream, Advertisement)> {
        let (reader, writer, child): (BoxReader, BoxWriter, Option<Child>) = match &self.endpoint {
            Endpoint::Git { host, port, path } => {
                let socket = TcpStream::connect((host.as_str(), *port)).await?;
                socket.set_nodelay(true)?;
                let (read, mut write) = socket.into_split();
                let request = PktLine::from_bytes(format!("{service} {path}\0host={host}\0"));
                write.write_all(&request.encode()).await?;
                (Box::new(read), Box::new(write), None)
            }
            Endpoint::Ssh {
                user,
                host,
                port,
                path,
            } => {
                let mut command = Process::new("ssh");
                if let Some(port) = port {
                    command.arg("-p").arg(port.to_string());
                }
                let target = match user {
                    Some(user) => format!("{user}@{host}"),
                    None => host.clone(),
                };
                command
                    .arg(target)
                    .arg(format!("{service} '{}'", path.replace('\'', "'\\''")))
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true);

                let mut child = command.spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| Error::Internal("ssh stdin not captured".to_string()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| Error::Internal("ssh stdout not captured".to_string()))?;
                (Box::new(stdout), Box::new(stdin), Some(child))
            }
            other => {
                return Err(Error::UnsupportedEndpoint(format!(
                    "{other} is not a stream endpoint"
                )))
            }
        };

        let mut pkt_reader = AsyncPktLineReader::new(reader);
        let advertisement = Advertisement::read_async(&mut pkt_reader).await?;
        debug!(endpoint = %self.endpoint, %service, refs = advertisement.refs.len(), "stream connected");

        Ok((
            Stream {
                reader: pkt_reader.into_inner(),
                writer,
                _child: child,
            },
            advertisement,
        ))
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn open(&self, service: Service) -> Result<Box<dyn Session>> {
        let (stream, advertisement) = self.connect(service).await?;
        Ok(Box::new(StreamSession {
            transport: self.clone(),
            service,
            advertisement,
            stream: Some(stream),
        }))
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

struct Stream {
    reader: BoxReader,
    writer: BoxWriter,
    _child: Option<Child>,
}

impl Stream {
    /// Sends `request`, closes the write side and reads the whole response.
    async fn exchange(mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.writer.write_all(request).await?;
        self.writer.flush().await?;
        self.writer.shutdown().await?;

        let mut response = Vec::new();
        self.reader.read_to_end(&mut response).await?;
        Ok(response)
    }
}

struct StreamSession {
    transport: StreamTransport,
    service: Service,
    advertisement: Advertisement,
    stream: Option<Stream>,
}

impl StreamSession {
    /// Takes the open stream, reconnecting if it was already used.
    async fn take_stream(&mut self) -> Result<Stream> {
        if let Some(stream) = self.stream.take() {
            return Ok(stream);
        }
        let (stream, advertisement) = self.transport.connect(self.service).await?;
        self.advertisement = advertisement;
        Ok(stream)
    }
}

#[async_trait]
impl Session for StreamSession {
    fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResponse> {
        let stream = self.take_stream().await?;
        let (body, filtered) =
            encode_upload_request(request, &self.advertisement, &self.transport.agent)?;
        let response = stream.exchange(&body).await?;
        let pack = decode_upload_response(&response, self.advertisement.supports("side-band-64k"))?;
        Ok(FetchResponse { pack, filtered })
    }

    async fn push(&mut self, commands: &[Command], pack: Vec<u8>) -> Result<PushReport> {
        let stream = self.take_stream().await?;
        let body =
            encode_push_request(commands, &self.advertisement, &pack, &self.transport.agent)?;
        let response = stream.exchange(&body).await?;
        Ok(decode_push_report(&response)?)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // A bare flush tells the server the client wants nothing.
            stream.writer.write_all(&PktLine::Flush.encode()).await?;
            stream.writer.shutdown().await?;
        }
        Ok(())
    }
}
