//! Route model: where a fired job's payload is delivered.
//!
//! Routes live in the replicated route table and are immutable once added
//! (delete + add to change one). Two sink kinds exist: an HTTP webhook and a
//! message-bus topic on a named host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RouteError {
    #[error("invalid route id")]
    InvalidId,

    #[error("invalid webhook url")]
    InvalidWebhookUrl,

    #[error("invalid bus topic or host")]
    InvalidBusTarget,

    #[error("route not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Http,
    Bus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: RouteKind,

    /// POST target for `http` routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Topic for `bus` routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Bus bootstrap host for `bus` routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Route {
    pub fn http(id: impl Into<String>, webhook_url: impl Into<String>) -> Route {
        Route {
            id: id.into(),
            kind: RouteKind::Http,
            webhook_url: Some(webhook_url.into()),
            topic: None,
            host: None,
        }
    }

    pub fn bus(id: impl Into<String>, topic: impl Into<String>, host: impl Into<String>) -> Route {
        Route {
            id: id.into(),
            kind: RouteKind::Bus,
            webhook_url: None,
            topic: Some(topic.into()),
            host: Some(host.into()),
        }
    }

    pub fn validate(&self) -> Result<(), RouteError> {
        if self.id.is_empty() {
            return Err(RouteError::InvalidId);
        }
        match self.kind {
            RouteKind::Http => match &self.webhook_url {
                Some(url) if !url.is_empty() => Ok(()),
                _ => Err(RouteError::InvalidWebhookUrl),
            },
            RouteKind::Bus => {
                let topic_ok = self.topic.as_deref().is_some_and(|t| !t.is_empty());
                let host_ok = self.host.as_deref().is_some_and(|h| !h.is_empty());
                if topic_ok && host_ok {
                    Ok(())
                } else {
                    Err(RouteError::InvalidBusTarget)
                }
            }
        }
    }
}
