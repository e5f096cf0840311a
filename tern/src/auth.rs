// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Authentication and topic-authorization policy seam.
//!
//! Bundled policies beyond the anonymous baseline live outside the core;
//! the broker only combines policy decisions.

use std::net::SocketAddr;

use futures::future::BoxFuture;

/// Result of an authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,

    /// The policy cannot decide; its result is ignored.
    Abstain,
}

/// What a topic is being used for when a policy is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicAction {
    Publish,
    Subscribe,
    Receive,
}

/// Connection attributes a policy may inspect.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub remote_address: Option<SocketAddr>,
}

/// Authentication and topic-authorization policy.
///
/// The broker's overall decision is allow iff no policy denies;
/// abstaining policies are ignored.
pub trait AuthPolicy: Send + Sync {
    fn authenticate<'a>(&'a self, context: &'a AuthContext) -> BoxFuture<'a, AuthDecision>;

    /// Check whether `topic` may be used for `action` by this connection.
    ///
    /// Only consulted when topic checking is enabled in the broker config.
    fn topic_allowed<'a>(
        &'a self,
        context: &'a AuthContext,
        topic: &'a str,
        action: TopicAction,
    ) -> BoxFuture<'a, bool> {
        let _ = (context, topic, action);
        Box::pin(async { true })
    }
}

/// Baseline policy accepting every connection and topic.
#[derive(Debug, Default, Clone)]
pub struct AllowAnonymous {}

impl AuthPolicy for AllowAnonymous {
    fn authenticate<'a>(&'a self, _context: &'a AuthContext) -> BoxFuture<'a, AuthDecision> {
        Box::pin(async { AuthDecision::Allow })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AuthContext {
        AuthContext {
            client_id: "c1".to_string(),
            username: None,
            password: None,
            remote_address: None,
        }
    }

    #[test]
    fn test_allow_anonymous() {
        tokio_test::block_on(async {
            let policy = AllowAnonymous::default();
            let ctx = context();
            assert_eq!(policy.authenticate(&ctx).await, AuthDecision::Allow);
            assert!(
                policy
                    .topic_allowed(&ctx, "any/topic", TopicAction::Publish)
                    .await
            );
        });
    }
}
