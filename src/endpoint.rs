//! Endpoint addressing.
//!
//! An endpoint is an addressable queue location:
//! `scheme://host:port/queueName[;subqueue=sub]`. The scheme selects the
//! transport, host and port locate the peer, the path names the queue, and
//! the reserved suffix addresses a sub-queue. The port defaults to 2200.

use std::fmt;
use std::str::FromStr;

use courier_queue::QueueName;
use url::Url;

use crate::error::{CourierError, CourierResult};

/// Port assumed when an endpoint URI does not carry one
pub const DEFAULT_PORT: u16 = 2200;

/// An addressable queue location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: u16,
    queue: QueueName,
}

impl Endpoint {
    /// Parse an endpoint URI
    pub fn parse(uri: &str) -> CourierResult<Self> {
        let parsed = Url::parse(uri).map_err(|e| CourierError::invalid_endpoint(uri, e))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| CourierError::invalid_endpoint(uri, "missing host"))?
            .to_string();
        let port = parsed.port().unwrap_or(DEFAULT_PORT);

        let path = parsed.path().trim_start_matches('/');
        if path.is_empty() {
            return Err(CourierError::invalid_endpoint(uri, "missing queue name"));
        }
        let queue: QueueName = path
            .parse()
            .map_err(|e| CourierError::invalid_endpoint(uri, e))?;

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            port,
            queue,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The queue (or sub-queue) this endpoint addresses
    pub fn queue_name(&self) -> &QueueName {
        &self.queue
    }

    /// This endpoint with a sub-queue of the same queue addressed
    pub fn with_subqueue(&self, subqueue: &str) -> CourierResult<Self> {
        Ok(Self {
            queue: self.queue.with_subqueue(subqueue)?,
            ..self.clone()
        })
    }

    /// This endpoint with any sub-queue suffix dropped
    pub fn main(&self) -> Self {
        Self {
            queue: self.queue.as_main(),
            ..self.clone()
        }
    }

    /// The full URI string
    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}/{}",
            self.scheme, self.host, self.port, self.queue
        )
    }
}

impl FromStr for Endpoint {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let ep = Endpoint::parse("courier://broker.local:4100/orders").unwrap();
        assert_eq!(ep.scheme(), "courier");
        assert_eq!(ep.host(), "broker.local");
        assert_eq!(ep.port(), 4100);
        assert_eq!(ep.queue_name().queue(), "orders");
        assert!(!ep.queue_name().is_subqueue());
    }

    #[test]
    fn port_defaults_to_2200() {
        let ep = Endpoint::parse("courier://localhost/orders").unwrap();
        assert_eq!(ep.port(), DEFAULT_PORT);
        assert_eq!(ep.to_string(), "courier://localhost:2200/orders");
    }

    #[test]
    fn parses_subqueue_suffix() {
        let ep = Endpoint::parse("courier://localhost/orders;subqueue=errors").unwrap();
        assert_eq!(ep.queue_name().queue(), "orders");
        assert_eq!(ep.queue_name().subqueue_name(), Some("errors"));
        assert_eq!(ep.main().queue_name().subqueue_name(), None);
    }

    #[test]
    fn display_round_trips() {
        for uri in [
            "courier://localhost:2200/orders",
            "courier://broker:9000/billing;subqueue=timeout",
        ] {
            let ep = Endpoint::parse(uri).unwrap();
            assert_eq!(ep.to_string(), uri);
            assert_eq!(Endpoint::parse(&ep.to_string()).unwrap(), ep);
        }
    }

    #[test]
    fn rejects_missing_queue_or_host() {
        assert!(Endpoint::parse("courier://localhost:2200/").is_err());
        assert!(Endpoint::parse("not a uri").is_err());
    }

    #[test]
    fn with_subqueue_addresses_partition() {
        let ep = Endpoint::parse("courier://localhost/orders").unwrap();
        let errors = ep.with_subqueue("errors").unwrap();
        assert_eq!(
            errors.to_string(),
            "courier://localhost:2200/orders;subqueue=errors"
        );
    }
}
