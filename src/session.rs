//! Publisher/subscriber session pair owned by one target.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Target;
use crate::transport::{ConnectOptions, Connector, Session, TransportBuilder, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    fn suffix(self) -> &'static str {
        match self {
            Role::Publisher => "pub",
            Role::Subscriber => "sub",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Subscriber => f.write_str("subscriber"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("{role} session for target '{target}' failed to connect: {source}")]
    Connect {
        target: String,
        role: Role,
        #[source]
        source: TransportError,
    },
    #[error("{role} session for target '{target}' failed to close: {source}")]
    Close {
        target: String,
        role: Role,
        #[source]
        source: TransportError,
    },
    #[error("target '{0}' has only one live session; close it before reopening")]
    Partial(String),
}

/// Client identity presented to the broker: `<target>-pub` / `<target>-sub`.
pub fn identity(target: &Target, role: Role) -> String {
    format!("{}-{}", target.name, role.suffix())
}

/// Both sessions are open or both are closed. A half-open pair only exists
/// after a failed `open`, and the owner is expected to `close` it.
pub struct SessionPair {
    target: Target,
    connector: Arc<dyn Connector>,
    opts: ConnectOptions,
    publisher: Option<Box<dyn Session>>,
    subscriber: Option<Box<dyn Session>>,
}

impl SessionPair {
    pub fn new(target: Target, connector: Arc<dyn Connector>, opts: ConnectOptions) -> Self {
        Self {
            target,
            connector,
            opts,
            publisher: None,
            subscriber: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_open(&self) -> bool {
        self.publisher.is_some() && self.subscriber.is_some()
    }

    /// `(publisher, subscriber)` when the pair is open.
    pub fn sessions(&self) -> Option<(&dyn Session, &dyn Session)> {
        match (&self.publisher, &self.subscriber) {
            (Some(p), Some(s)) => Some((p.as_ref(), s.as_ref())),
            _ => None,
        }
    }

    /// Open publisher then subscriber. No-op when already open.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        match (&self.publisher, &self.subscriber) {
            (Some(_), Some(_)) => return Ok(()),
            (None, None) => {}
            _ => return Err(SessionError::Partial(self.target.name.clone())),
        }

        let publisher = self.connect(Role::Publisher).await?;
        self.publisher = Some(publisher);
        let subscriber = self.connect(Role::Subscriber).await?;
        self.subscriber = Some(subscriber);

        info!(
            target_name = %self.target.name,
            pub_addr = %self.target.pub_addr,
            sub_addr = %self.target.sub_addr,
            "Session pair open"
        );
        Ok(())
    }

    async fn connect(&self, role: Role) -> Result<Box<dyn Session>, SessionError> {
        let endpoint = match role {
            Role::Publisher => &self.target.pub_addr,
            Role::Subscriber => &self.target.sub_addr,
        };
        let id = identity(&self.target, role);
        debug!(target_name = %self.target.name, %role, %endpoint, identity = %id, "Connecting");
        TransportBuilder::open_with_retry(self.connector.as_ref(), endpoint, &id, &self.opts)
            .await
            .map_err(|source| SessionError::Connect {
                target: self.target.name.clone(),
                role,
                source,
            })
    }

    /// Close publisher then subscriber. Both are attempted; the first failure is
    /// returned. The pair holds no sessions afterwards.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let mut first_err = None;
        for (role, slot) in [
            (Role::Publisher, self.publisher.take()),
            (Role::Subscriber, self.subscriber.take()),
        ] {
            let Some(session) = slot else { continue };
            if let Err(source) = session.close().await {
                debug!(target_name = %self.target.name, %role, error = %source, "Close failed");
                first_err.get_or_insert(SessionError::Close {
                    target: self.target.name.clone(),
                    role,
                    source,
                });
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                debug!(target_name = %self.target.name, "Session pair closed");
                Ok(())
            }
        }
    }
}
