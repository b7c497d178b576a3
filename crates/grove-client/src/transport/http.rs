//! Smart HTTP transport.

use super::{FetchResponse, Session, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use grove_git::{
    decode_push_report, decode_upload_response, encode_push_request, encode_upload_request,
    Advertisement, Command, FetchRequest, PktLineReader, PushReport, Service,
};
use reqwest::{Client, StatusCode};
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Talks to a smart HTTP server (`info/refs`, `git-upload-pack`, `git-receive-pack`).
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base: String,
    credentials: Option<(String, Option<String>)>,
    agent: String,
}

impl HttpTransport {
    /// Creates a transport for the repository at `url`.
    ///
    /// Credentials in the URL's user-info are sent as basic auth.
    pub fn new(url: Url, user_agent: &str) -> Result<Self> {
        let credentials = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(|user| (user.to_string(), url.password().map(str::to_string)));

        let mut base = url;
        let _ = base.set_username("");
        let _ = base.set_password(None);

        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base: base.as_str().trim_end_matches('/').to_string(),
            credentials,
            agent: user_agent.to_string(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        }
    }

    async fn post(&self, service: Service, body: Vec<u8>) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base, service);
        let request = self
            .client
            .post(&url)
            .header(
                "Content-Type",
                format!("application/x-{}-request", service),
            )
            .header("Accept", format!("application/x-{}-result", service))
            .body(body);

        let response = self.authorize(request).send().await?;
        let response = check_status(response, &url).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

async fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(Error::not_found("repository", url));
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Transport(format!(
        "request to {url} failed with status {status}: {}",
        body.trim()
    )))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, service: Service) -> Result<Box<dyn Session>> {
        let url = format!("{}/info/refs?service={}", self.base, service);
        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = check_status(response, &url).await?;
        let body = response.bytes().await?;

        let advertisement = Advertisement::read(&mut PktLineReader::new(Cursor::new(&body[..])))?;
        debug!(url = %url, refs = advertisement.refs.len(), "http session opened");

        Ok(Box::new(HttpSession {
            transport: self.clone(),
            advertisement,
        }))
    }

    fn describe(&self) -> String {
        self.base.clone()
    }
}

struct HttpSession {
    transport: HttpTransport,
    advertisement: Advertisement,
}

#[async_trait]
impl Session for HttpSession {
    fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResponse> {
        let (body, filtered) =
            encode_upload_request(request, &self.advertisement, &self.transport.agent)?;
        let response = self.transport.post(Service::UploadPack, body).await?;
        let pack = decode_upload_response(
            &response,
            self.advertisement.supports("side-band-64k"),
        )?;
        Ok(FetchResponse { pack, filtered })
    }

    async fn push(&mut self, commands: &[Command], pack: Vec<u8>) -> Result<PushReport> {
        let body =
            encode_push_request(commands, &self.advertisement, &pack, &self.transport.agent)?;
        let response = self.transport.post(Service::ReceivePack, body).await?;
        Ok(decode_push_report(&response)?)
    }
}
