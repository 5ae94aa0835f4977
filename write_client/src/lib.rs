//! A minimal HTTP client for the InfluxDB [2.0 write API][2api].
//!
//! [2api]: https://docs.influxdata.com/influxdb/v2/api/#operation/PostWrite

use secrecy::{ExposeSecret, Secret};
use snafu::{ResultExt, Snafu};

/// Errors that occur while making a write request.
#[derive(Debug, Snafu)]
pub enum RequestError {
    /// While making the request or receiving the response, an error occurred
    /// in the HTTP transport.
    #[snafu(display("Error while processing the HTTP request: {source}"))]
    ReqwestProcessing {
        /// The underlying error object from `reqwest`.
        source: reqwest::Error,
    },

    /// The server responded with an error status code.
    #[snafu(display("HTTP request returned an error: {status}, `{text}`"))]
    Http {
        /// The status code returned by the server.
        status: reqwest::StatusCode,
        /// Any response body the server sent along with the status code.
        text: String,
    },
}

/// A specialized `Result` for errors from this client.
pub type Result<T, E = RequestError> = std::result::Result<T, E>;

/// Timestamp precision sent as the `precision` query parameter of a write
/// request. The request body must carry timestamps in this unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Precision {
    /// Seconds since the epoch.
    Second,
    /// Milliseconds since the epoch.
    Millisecond,
    /// Microseconds since the epoch.
    Microsecond,
    /// Nanoseconds since the epoch.
    Nanosecond,
}

impl Precision {
    /// The value of the `precision` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "s",
            Self::Millisecond => "ms",
            Self::Microsecond => "us",
            Self::Nanosecond => "ns",
        }
    }
}

/// Client to a server supporting the InfluxData 2.0 API.
#[derive(Debug, Clone)]
pub struct Client {
    /// The base URL of the server, in `protocol://server:port` format.
    url: String,
    /// The token to use for authenticating on each request to the server.
    auth_token: Option<Secret<String>>,
    /// A [`reqwest::Client`] for handling HTTP requests.
    reqwest: reqwest::Client,
}

impl Client {
    /// Create a new client pointing to the URL specified in
    /// `protocol://server:port` format.
    ///
    /// # Example
    ///
    /// ```
    /// let client = write_client::Client::new("http://localhost:8086");
    /// ```
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            reqwest: reqwest::Client::new(),
        }
    }

    /// Set the token that will be sent as `Authorization: Token <token>` with
    /// each request to the server.
    ///
    /// # Example
    ///
    /// ```
    /// let client = write_client::Client::new("http://localhost:8086")
    ///     .with_auth_token("secret-token-string");
    /// ```
    pub fn with_auth_token<S: Into<String>>(mut self, auth_token: S) -> Self {
        self.auth_token = Some(Secret::new(auth_token.into()));
        self
    }

    /// Write line protocol data to the specified organization and bucket.
    pub async fn write(
        &self,
        org: &str,
        bucket: &str,
        precision: Precision,
        body: impl Into<String> + Send,
    ) -> Result<()> {
        let body = body.into();
        let write_url = format!("{}/api/v2/write", self.url);

        let mut request = self
            .reqwest
            .post(&write_url)
            .query(&[("org", org), ("bucket", bucket), ("precision", precision.as_str())])
            .body(body);

        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Token {}", token.expose_secret()));
        }

        let response = request.send().await.context(ReqwestProcessingSnafu)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.context(ReqwestProcessingSnafu)?;
            HttpSnafu { status, text }.fail()?;
        }

        Ok(())
    }
}
