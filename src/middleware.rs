//! Middleware resolver (spec.md §4.D): for a given canonical route path,
//! materialise the effective `{onRequest, authenticate, onResponse,
//! onError}` chain by picking, per hook, the *most specific* registered
//! scope whose prefix covers the path — the registration-model
//! replacement for "walk parent directories merging `_middleware`
//! exports" (SPEC_FULL.md §2). Grounded on the base crate's
//! `SCOPE_MIDDLEWARES` distributed slice and its `#[scope]` macro, which
//! attaches a middleware array to a path prefix rather than to a single
//! directory entry.

use crate::context::User;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use std::future::Future;
use std::pin::Pin;

pub type OnRequestFn = fn(&Request) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type AuthenticateFn =
    fn(&Request) -> Pin<Box<dyn Future<Output = Result<Option<User>>> + Send>>;
pub type OnResponseFn =
    fn(&Request, &mut Response) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type OnErrorFn = fn(&Error, &Request) -> Pin<Box<dyn Future<Output = ()> + Send>>;

/// One hook exported by a `#[middleware(...)]`-registered function. A
/// single registration covers exactly one hook, same as a `_middleware`
/// module in the source system exports one function per named export.
#[derive(Clone, Copy)]
pub enum Hook {
    OnRequest(OnRequestFn),
    Authenticate(AuthenticateFn),
    OnResponse(OnResponseFn),
    OnError(OnErrorFn),
}

/// A registered middleware, scoped to every route whose canonical path
/// starts with `prefix` (`""` scopes to every route). Populated by
/// `kindling_macros::middleware` into `MIDDLEWARE_REGISTRATIONS`.
#[derive(Clone, Copy)]
pub struct MiddlewareInfo {
    pub prefix: &'static str,
    pub hook: Hook,
    pub source: &'static str,
}

#[linkme::distributed_slice]
pub static MIDDLEWARE_REGISTRATIONS: [MiddlewareInfo];

/// The effective chain for one route: at most one function per hook, the
/// one registered at the longest prefix that covers the route's path
/// (spec.md §4.D "nearest ancestor wins").
#[derive(Clone, Copy, Default)]
pub struct Chain {
    pub on_request: Option<OnRequestFn>,
    pub authenticate: Option<AuthenticateFn>,
    pub on_response: Option<OnResponseFn>,
    pub on_error: Option<OnErrorFn>,
}

fn covers(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

impl Chain {
    /// Resolves the chain for `path` by scanning every registered
    /// middleware once, keeping the longest covering prefix seen so far
    /// for each hook. Cheap enough to call once per request
    /// (`http_engine::dispatch` does): `MIDDLEWARE_REGISTRATIONS` is fixed
    /// at link time and typically tiny next to a request's I/O.
    pub fn resolve(path: &str) -> Chain {
        let mut chain = Chain::default();
        let mut best_len = [-1i64; 4];

        for reg in MIDDLEWARE_REGISTRATIONS.iter() {
            if !covers(reg.prefix, path) {
                continue;
            }
            let len = reg.prefix.len() as i64;
            let slot = match reg.hook {
                Hook::OnRequest(_) => 0,
                Hook::Authenticate(_) => 1,
                Hook::OnResponse(_) => 2,
                Hook::OnError(_) => 3,
            };
            if len < best_len[slot] {
                continue;
            }
            best_len[slot] = len;
            match reg.hook {
                Hook::OnRequest(f) => chain.on_request = Some(f),
                Hook::Authenticate(f) => chain.authenticate = Some(f),
                Hook::OnResponse(f) => chain.on_response = Some(f),
                Hook::OnError(f) => chain.on_error = Some(f),
            }
        }

        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_matches_prefix_boundaries() {
        assert!(covers("", "/anything"));
        assert!(covers("/admin", "/admin"));
        assert!(covers("/admin", "/admin/users"));
        assert!(!covers("/admin", "/administration"));
    }

    #[test]
    fn empty_registry_resolves_to_no_hooks() {
        let chain = Chain::resolve("/x");
        assert!(chain.on_request.is_none());
        assert!(chain.authenticate.is_none());
        assert!(chain.on_response.is_none());
        assert!(chain.on_error.is_none());
    }
}
