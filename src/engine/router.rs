// SPDX-License-Identifier: MIT

//! Routing functions for conditional edges
//!
//! A router looks at the post-merge state and names one or more route keys.
//! Every router declares the closed set of keys it can ever produce, so a graph
//! can check at compile time that each key has a destination.

use async_trait::async_trait;
use std::marker::PhantomData;

use super::error::NodeError;
use super::state::WorkflowState;

#[async_trait]
pub trait Router: Send + Sync {
    /// Every key `route` may return
    fn outcomes(&self) -> Vec<String>;

    /// Route keys for the given state; several keys fan out
    async fn route(&self, state: &WorkflowState) -> Result<Vec<String>, NodeError>;
}

type RouteFn = Box<dyn Fn(&WorkflowState) -> Result<Vec<String>, NodeError> + Send + Sync>;

/// Router over plain string keys
pub struct FnRouter {
    outcomes: Vec<String>,
    f: RouteFn,
}

impl FnRouter {
    /// Router that may fan out to several keys
    pub fn new<I, S, F>(outcomes: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&WorkflowState) -> Result<Vec<String>, NodeError> + Send + Sync + 'static,
    {
        Self {
            outcomes: outcomes.into_iter().map(Into::into).collect(),
            f: Box::new(f),
        }
    }

    /// Router that always picks exactly one key
    pub fn single<I, S, F>(outcomes: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&WorkflowState) -> Result<String, NodeError> + Send + Sync + 'static,
    {
        Self::new(outcomes, move |state: &WorkflowState| Ok(vec![f(state)?]))
    }
}

#[async_trait]
impl Router for FnRouter {
    fn outcomes(&self) -> Vec<String> {
        self.outcomes.clone()
    }

    async fn route(&self, state: &WorkflowState) -> Result<Vec<String>, NodeError> {
        (self.f)(state)
    }
}

/// A closed set of route keys, usually a fieldless enum
///
/// ```
/// use stategraph_rs::engine::RouteKey;
///
/// #[derive(Clone, Copy)]
/// enum Grade { Useful, NotUseful, NotSupported }
///
/// impl RouteKey for Grade {
///     const ALL: &'static [Self] = &[Grade::Useful, Grade::NotUseful, Grade::NotSupported];
///
///     fn key(&self) -> &'static str {
///         match self {
///             Grade::Useful => "useful",
///             Grade::NotUseful => "not useful",
///             Grade::NotSupported => "not supported",
///         }
///     }
/// }
/// ```
pub trait RouteKey: Sized + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn key(&self) -> &'static str;
}

/// Router whose outcomes are the variants of a `RouteKey` type
pub struct EnumRouter<K> {
    f: Box<dyn Fn(&WorkflowState) -> Result<Vec<K>, NodeError> + Send + Sync>,
    _keys: PhantomData<fn() -> K>,
}

impl<K: RouteKey> EnumRouter<K> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&WorkflowState) -> Result<Vec<K>, NodeError> + Send + Sync + 'static,
    {
        Self {
            f: Box::new(f),
            _keys: PhantomData,
        }
    }

    pub fn single<F>(f: F) -> Self
    where
        F: Fn(&WorkflowState) -> Result<K, NodeError> + Send + Sync + 'static,
    {
        Self::new(move |state: &WorkflowState| Ok(vec![f(state)?]))
    }
}

#[async_trait]
impl<K: RouteKey> Router for EnumRouter<K> {
    fn outcomes(&self) -> Vec<String> {
        K::ALL.iter().map(|k| k.key().to_string()).collect()
    }

    async fn route(&self, state: &WorkflowState) -> Result<Vec<String>, NodeError> {
        let keys = (self.f)(state)?;
        Ok(keys.iter().map(|k| k.key().to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Source {
        WebSearch,
        Vectorstore,
    }

    impl RouteKey for Source {
        const ALL: &'static [Self] = &[Source::WebSearch, Source::Vectorstore];

        fn key(&self) -> &'static str {
            match self {
                Source::WebSearch => "web_search",
                Source::Vectorstore => "vectorstore",
            }
        }
    }

    fn state_with(key: &str, value: serde_json::Value) -> WorkflowState {
        let mut state = WorkflowState::empty();
        state.update(key, value);
        state
    }

    #[tokio::test]
    async fn test_fn_router_fan_out() {
        let router = FnRouter::new(["b", "c", "d"], |state: &WorkflowState| {
            match state.get("which").and_then(|v| v.as_str()) {
                Some("cd") => Ok(vec!["c".to_string(), "d".to_string()]),
                _ => Ok(vec!["b".to_string(), "c".to_string()]),
            }
        });

        assert_eq!(router.outcomes(), vec!["b", "c", "d"]);
        let routes = router.route(&state_with("which", json!("cd"))).await.unwrap();
        assert_eq!(routes, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_fn_router_single() {
        let router = FnRouter::single(["yes", "no"], |state: &WorkflowState| {
            let flag = state.get("flag").and_then(|v| v.as_bool()).ok_or("flag missing")?;
            Ok(if flag { "yes" } else { "no" }.to_string())
        });

        assert_eq!(router.route(&state_with("flag", json!(false))).await.unwrap(), vec!["no"]);
        assert!(router.route(&WorkflowState::empty()).await.is_err());
    }

    #[tokio::test]
    async fn test_enum_router() {
        let router = EnumRouter::single(|state: &WorkflowState| {
            Ok(match state.get("question").and_then(|v| v.as_str()) {
                Some(q) if q.contains("news") => Source::WebSearch,
                _ => Source::Vectorstore,
            })
        });

        assert_eq!(router.outcomes(), vec!["web_search", "vectorstore"]);
        let routes = router
            .route(&state_with("question", json!("latest news")))
            .await
            .unwrap();
        assert_eq!(routes, vec!["web_search"]);
    }
}
