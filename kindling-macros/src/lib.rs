//! Attribute macros that register routes, queues, WebSocket handlers, and
//! middleware into `kindling`'s distributed slices (SPEC_FULL.md §2).
//! Grounded on the base crate's `firework-macros`/`macros` crate
//! (`route_macro`, `websocket_macro`, the `#[middleware]` phase split):
//! each attribute here wraps a plain `async fn` into the boxed-future
//! shape `manifest::Services::build()` expects and drops a registration
//! record into the matching `linkme::distributed_slice`, rather than the
//! teacher's runtime `Server::get`/`post` builder calls.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Expr, Ident, ItemFn, LitInt, LitStr, Token};

/// `#[get("/posts/:id")]`, `#[post("/posts", cors, timeout = 5)]`, … —
/// convenience forms of `#[route(METHOD, "path", ...)]` for the verbs a
/// route module commonly exports (spec.md §6 "named exports per HTTP
/// verb").
#[proc_macro_attribute]
pub fn get(attr: TokenStream, item: TokenStream) -> TokenStream {
    route_impl("GET", attr, item)
}

#[proc_macro_attribute]
pub fn post(attr: TokenStream, item: TokenStream) -> TokenStream {
    route_impl("POST", attr, item)
}

#[proc_macro_attribute]
pub fn put(attr: TokenStream, item: TokenStream) -> TokenStream {
    route_impl("PUT", attr, item)
}

#[proc_macro_attribute]
pub fn patch(attr: TokenStream, item: TokenStream) -> TokenStream {
    route_impl("PATCH", attr, item)
}

/// `del`, not `delete` — the base system reserves `delete` as a method
/// name in hosts where it is a keyword; this crate keeps the same
/// convention at the macro surface (spec.md §4.E.3).
#[proc_macro_attribute]
pub fn del(attr: TokenStream, item: TokenStream) -> TokenStream {
    route_impl("DELETE", attr, item)
}

#[proc_macro_attribute]
pub fn options(attr: TokenStream, item: TokenStream) -> TokenStream {
    route_impl("OPTIONS", attr, item)
}

/// `#[route(METHOD, "/path", ...)]`: the general form the verb-specific
/// attributes above delegate to.
#[proc_macro_attribute]
pub fn route(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as RouteWithMethodArgs);
    expand_route(&args.method, args.rest, parse_macro_input!(item as ItemFn))
}

struct RouteWithMethodArgs {
    method: String,
    rest: RouteArgs,
}

impl Parse for RouteWithMethodArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let method_ident: Ident = input.parse()?;
        input.parse::<Token![,]>()?;
        let rest: RouteArgs = input.parse()?;
        Ok(RouteWithMethodArgs { method: method_ident.to_string().to_ascii_uppercase(), rest })
    }
}

/// Parsed `("/path", cors, etag, timeout = 5, cache = 60, accepts = "application/json")`.
struct RouteArgs {
    path: LitStr,
    cors: bool,
    etag: bool,
    timeout: Option<u64>,
    cache: Option<u32>,
    accepts: Vec<String>,
}

impl Parse for RouteArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let path: LitStr = input.parse()?;
        let mut cors = false;
        let mut etag = false;
        let mut timeout = None;
        let mut cache = None;
        let mut accepts = Vec::new();

        while input.peek(Token![,]) {
            input.parse::<Token![,]>()?;
            if input.is_empty() {
                break;
            }
            let ident: Ident = input.parse()?;
            match ident.to_string().as_str() {
                "cors" => cors = true,
                "etag" => etag = true,
                "timeout" => {
                    input.parse::<Token![=]>()?;
                    let lit: LitInt = input.parse()?;
                    timeout = Some(lit.base10_parse()?);
                }
                "cache" => {
                    input.parse::<Token![=]>()?;
                    let lit: LitInt = input.parse()?;
                    cache = Some(lit.base10_parse()?);
                }
                "accepts" => {
                    input.parse::<Token![=]>()?;
                    let lit: LitStr = input.parse()?;
                    accepts.push(lit.value());
                }
                other => {
                    return Err(syn::Error::new(ident.span(), format!("unknown route option `{}`", other)));
                }
            }
        }

        Ok(RouteArgs { path, cors, etag, timeout, cache, accepts })
    }
}

fn route_impl(method: &str, attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as RouteArgs);
    expand_route(method, args, parse_macro_input!(item as ItemFn))
}

fn expand_route(method: &str, args: RouteArgs, input: ItemFn) -> TokenStream {
    let fn_name = &input.sig.ident;
    let path = &args.path;
    let wrapper_name = Ident::new(&format!("__kindling_route_{}_{}", method.to_ascii_lowercase(), fn_name), fn_name.span());
    let static_name =
        Ident::new(&format!("__KINDLING_ROUTE_{}_{}", method, fn_name.to_string().to_ascii_uppercase()), fn_name.span());
    // The registration-record lookup spec.md §9 calls for in place of
    // `url.self()`'s call-stack introspection: one function per registered
    // handler, closing over its own path literal.
    let url_fn_name = Ident::new(&format!("{}_url", fn_name), fn_name.span());
    let source = source_literal(&format!("{} ({})", args.path.value(), fn_name));
    let cors = args.cors;
    let etag = args.etag;
    let timeout = option_u64_tokens(args.timeout);
    let cache = option_u32_tokens(args.cache);
    let accepts = args.accepts;

    let output = quote! {
        #input

        fn #wrapper_name(
            req: ::kindling::request::Request,
            meta: ::kindling::manifest::HttpMeta,
        ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ::kindling::error::Result<::kindling::response::HandlerReturn>> + ::std::marker::Send>> {
            ::std::boxed::Box::pin(#fn_name(req, meta))
        }

        /// `url.self()` for this handler's own route (spec.md §4.A), bound
        /// to its registered path rather than recovered via introspection.
        #[allow(dead_code)]
        pub fn #url_fn_name(
            params: &::std::collections::HashMap<::std::string::String, ::kindling::path::ParamValue>,
            query: &::std::collections::HashMap<::std::string::String, ::kindling::path::ParamValue>,
        ) -> ::kindling::error::Result<::std::string::String> {
            ::kindling::path::url_for(#path, params, query)
        }

        #[::kindling::linkme::distributed_slice(::kindling::manifest::ROUTE_REGISTRATIONS)]
        #[allow(non_upper_case_globals)]
        static #static_name: ::kindling::manifest::RouteInfo = ::kindling::manifest::RouteInfo {
            method: #method,
            path: #path,
            accepts: &[#(#accepts),*],
            cors: #cors,
            cache_seconds: #cache,
            etag: #etag,
            timeout: #timeout,
            source: #source,
            handler: #wrapper_name,
        };
    };

    output.into()
}

/// `#[queue("jobs")]`, `#[queue("jobs.fifo", url = "/jobs/:group", timeout = 60, accepts = "application/json", on_error = handle_failure)]`.
#[proc_macro_attribute]
pub fn queue(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as QueueArgs);
    let input = parse_macro_input!(item as ItemFn);
    let fn_name = &input.sig.ident;
    let wrapper_name = Ident::new(&format!("__kindling_queue_{}", fn_name), fn_name.span());
    let static_name = Ident::new(&format!("__KINDLING_QUEUE_{}", fn_name.to_string().to_ascii_uppercase()), fn_name.span());
    let source = source_literal(&format!("{} ({})", args.name.value(), fn_name));
    let name = &args.name;
    let url = match &args.url {
        Some(u) => quote! { ::std::option::Option::Some(#u) },
        None => quote! { ::std::option::Option::None },
    };
    let timeout = option_u64_tokens(args.timeout);
    let accepts = &args.accepts;
    let on_error = match &args.on_error {
        Some(path) => quote! {
            {
                fn __kindling_queue_on_error_wrapper(
                    err: &::kindling::error::Error,
                    payload: &::kindling::serde_json::Value,
                ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ()> + ::std::marker::Send>> {
                    ::std::boxed::Box::pin(#path(err, payload))
                }
                ::std::option::Option::Some(__kindling_queue_on_error_wrapper as ::kindling::manifest::QueueErrorFn)
            }
        },
        None => quote! { ::std::option::Option::None },
    };

    let output = quote! {
        #input

        fn #wrapper_name(
            payload: ::kindling::serde_json::Value,
            meta: ::kindling::manifest::MessageMeta,
        ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ::kindling::error::Result<()>> + ::std::marker::Send>> {
            ::std::boxed::Box::pin(#fn_name(payload, meta))
        }

        #[::kindling::linkme::distributed_slice(::kindling::manifest::QUEUE_REGISTRATIONS)]
        #[allow(non_upper_case_globals)]
        static #static_name: ::kindling::manifest::QueueInfo = ::kindling::manifest::QueueInfo {
            name: #name,
            url: #url,
            timeout: #timeout,
            accepts: &[#(#accepts),*],
            source: #source,
            handler: #wrapper_name,
            on_error: #on_error,
        };
    };

    output.into()
}

struct QueueArgs {
    name: LitStr,
    url: Option<LitStr>,
    timeout: Option<u64>,
    accepts: Vec<String>,
    on_error: Option<Expr>,
}

impl Parse for QueueArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let name: LitStr = input.parse()?;
        let mut url = None;
        let mut timeout = None;
        let mut accepts = Vec::new();
        let mut on_error = None;

        while input.peek(Token![,]) {
            input.parse::<Token![,]>()?;
            if input.is_empty() {
                break;
            }
            let ident: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            match ident.to_string().as_str() {
                "url" => url = Some(input.parse()?),
                "timeout" => timeout = Some(input.parse::<LitInt>()?.base10_parse()?),
                "accepts" => accepts.push(input.parse::<LitStr>()?.value()),
                "on_error" => on_error = Some(input.parse()?),
                other => return Err(syn::Error::new(ident.span(), format!("unknown queue option `{}`", other))),
            }
        }

        Ok(QueueArgs { name, url, timeout, accepts, on_error })
    }
}

/// `#[websocket("/chat/:room", type = "json", timeout = 10, authenticate = auth, on_online = f, on_offline = f, on_message_received = f, on_message_sent = f, on_error = f)]`.
#[proc_macro_attribute]
pub fn websocket(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as WebSocketArgs);
    let input = parse_macro_input!(item as ItemFn);
    let fn_name = &input.sig.ident;
    let wrapper_name = Ident::new(&format!("__kindling_ws_{}", fn_name), fn_name.span());
    let static_name = Ident::new(&format!("__KINDLING_WS_{}", fn_name.to_string().to_ascii_uppercase()), fn_name.span());
    let source = source_literal(&format!("{} ({})", args.path.value(), fn_name));
    let path = &args.path;
    let timeout = option_u64_tokens(args.timeout);
    let msg_type = match args.msg_type.as_deref() {
        Some("json") => quote! { ::kindling::manifest::WsMessageType::Json },
        Some("binary") => quote! { ::kindling::manifest::WsMessageType::Binary },
        _ => quote! { ::kindling::manifest::WsMessageType::Text },
    };

    let authenticate = match &args.authenticate {
        Some(path) => quote! {
            {
                fn __kindling_ws_authenticate_wrapper(
                    headers: &::std::collections::HashMap<::std::string::String, ::std::string::String>,
                ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ::kindling::error::Result<::std::option::Option<::kindling::context::User>>> + ::std::marker::Send>> {
                    ::std::boxed::Box::pin(#path(headers))
                }
                ::std::option::Option::Some(__kindling_ws_authenticate_wrapper)
            }
        },
        None => quote! { ::std::option::Option::None },
    };
    let on_online = lifecycle_hook_tokens(&args.on_online, "on_online");
    let on_offline = lifecycle_hook_tokens(&args.on_offline, "on_offline");
    let on_message_received = observe_hook_tokens(&args.on_message_received, "on_message_received");
    let on_message_sent = observe_hook_tokens(&args.on_message_sent, "on_message_sent");
    let on_error = ws_error_hook_tokens(&args.on_error);

    let output = quote! {
        #input

        fn #wrapper_name(
            data: ::kindling::websocket::WsData,
            meta: ::kindling::websocket::WsMeta,
        ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ::kindling::error::Result<()>> + ::std::marker::Send>> {
            ::std::boxed::Box::pin(#fn_name(data, meta))
        }

        #[::kindling::linkme::distributed_slice(::kindling::manifest::WS_REGISTRATIONS)]
        #[allow(non_upper_case_globals)]
        static #static_name: ::kindling::manifest::WsInfo = ::kindling::manifest::WsInfo {
            path: #path,
            timeout: #timeout,
            msg_type: #msg_type,
            source: #source,
            handler: #wrapper_name,
            authenticate: #authenticate,
            on_online: #on_online,
            on_offline: #on_offline,
            on_message_received: #on_message_received,
            on_message_sent: #on_message_sent,
            on_error: #on_error,
        };
    };

    output.into()
}

struct WebSocketArgs {
    path: LitStr,
    timeout: Option<u64>,
    msg_type: Option<String>,
    authenticate: Option<Expr>,
    on_online: Option<Expr>,
    on_offline: Option<Expr>,
    on_message_received: Option<Expr>,
    on_message_sent: Option<Expr>,
    on_error: Option<Expr>,
}

impl Parse for WebSocketArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let path: LitStr = input.parse()?;
        let mut args = WebSocketArgs {
            path,
            timeout: None,
            msg_type: None,
            authenticate: None,
            on_online: None,
            on_offline: None,
            on_message_received: None,
            on_message_sent: None,
            on_error: None,
        };

        while input.peek(Token![,]) {
            input.parse::<Token![,]>()?;
            if input.is_empty() {
                break;
            }
            let ident: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            match ident.to_string().as_str() {
                "type" => args.msg_type = Some(input.parse::<LitStr>()?.value()),
                "timeout" => args.timeout = Some(input.parse::<LitInt>()?.base10_parse()?),
                "authenticate" => args.authenticate = Some(input.parse()?),
                "on_online" => args.on_online = Some(input.parse()?),
                "on_offline" => args.on_offline = Some(input.parse()?),
                "on_message_received" => args.on_message_received = Some(input.parse()?),
                "on_message_sent" => args.on_message_sent = Some(input.parse()?),
                "on_error" => args.on_error = Some(input.parse()?),
                other => return Err(syn::Error::new(ident.span(), format!("unknown websocket option `{}`", other))),
            }
        }

        Ok(args)
    }
}

fn lifecycle_hook_tokens(expr: &Option<Expr>, label: &str) -> proc_macro2::TokenStream {
    match expr {
        Some(path) => {
            let wrapper = Ident::new(&format!("__kindling_ws_{}_wrapper", label), Span::call_site());
            quote! {
                {
                    fn #wrapper(user_id: &str) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ()> + ::std::marker::Send>> {
                        let user_id = user_id.to_string();
                        ::std::boxed::Box::pin(async move { #path(&user_id).await })
                    }
                    ::std::option::Option::Some(#wrapper)
                }
            }
        }
        None => quote! { ::std::option::Option::None },
    }
}

fn observe_hook_tokens(expr: &Option<Expr>, label: &str) -> proc_macro2::TokenStream {
    match expr {
        Some(path) => {
            let wrapper = Ident::new(&format!("__kindling_ws_{}_wrapper", label), Span::call_site());
            quote! {
                {
                    fn #wrapper(
                        meta: &::kindling::websocket::WsMeta,
                        message: &::kindling::websocket::WsMessage,
                    ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ()> + ::std::marker::Send>> {
                        ::std::boxed::Box::pin(#path(meta, message))
                    }
                    ::std::option::Option::Some(#wrapper)
                }
            }
        }
        None => quote! { ::std::option::Option::None },
    }
}

fn ws_error_hook_tokens(expr: &Option<Expr>) -> proc_macro2::TokenStream {
    match expr {
        Some(path) => quote! {
            {
                fn __kindling_ws_on_error_wrapper(
                    err: &::kindling::error::Error,
                    connection_id: &str,
                ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ()> + ::std::marker::Send>> {
                    let connection_id = connection_id.to_string();
                    ::std::boxed::Box::pin(async move { #path(err, &connection_id).await })
                }
                ::std::option::Option::Some(__kindling_ws_on_error_wrapper)
            }
        },
        None => quote! { ::std::option::Option::None },
    }
}

/// `#[middleware]` / `#[middleware(prefix = "/admin")]` on one of
/// `authenticate`, `on_request`, `on_response`, `on_error` — the hook kind
/// is inferred from the function's name, mirroring how a `_middleware`
/// module in the source system exports one function per hook
/// (spec.md §6, §4.D).
#[proc_macro_attribute]
pub fn middleware(attr: TokenStream, item: TokenStream) -> TokenStream {
    let prefix = if attr.is_empty() {
        LitStr::new("", Span::call_site())
    } else {
        parse_macro_input!(attr as MiddlewarePrefix).prefix
    };
    let input = parse_macro_input!(item as ItemFn);
    let fn_name = &input.sig.ident;
    let source = source_literal(&fn_name.to_string());
    let static_name = Ident::new(&format!("__KINDLING_MIDDLEWARE_{}", fn_name.to_string().to_ascii_uppercase()), fn_name.span());

    let hook = match fn_name.to_string().as_str() {
        "authenticate" => quote! {
            ::kindling::middleware::Hook::Authenticate(__kindling_mw_wrapper)
        },
        "on_request" => quote! {
            ::kindling::middleware::Hook::OnRequest(__kindling_mw_wrapper)
        },
        "on_response" => quote! {
            ::kindling::middleware::Hook::OnResponse(__kindling_mw_wrapper)
        },
        "on_error" => quote! {
            ::kindling::middleware::Hook::OnError(__kindling_mw_wrapper)
        },
        other => {
            return syn::Error::new(
                fn_name.span(),
                format!("#[middleware] expects a function named `authenticate`, `on_request`, `on_response`, or `on_error`, found `{}`", other),
            )
            .to_compile_error()
            .into();
        }
    };

    let wrapper = match fn_name.to_string().as_str() {
        "authenticate" => quote! {
            fn __kindling_mw_wrapper(
                req: &::kindling::request::Request,
            ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ::kindling::error::Result<::std::option::Option<::kindling::context::User>>> + ::std::marker::Send>> {
                ::std::boxed::Box::pin(#fn_name(req))
            }
        },
        "on_request" => quote! {
            fn __kindling_mw_wrapper(
                req: &::kindling::request::Request,
            ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ::kindling::error::Result<()>> + ::std::marker::Send>> {
                ::std::boxed::Box::pin(#fn_name(req))
            }
        },
        "on_response" => quote! {
            fn __kindling_mw_wrapper(
                req: &::kindling::request::Request,
                res: &mut ::kindling::response::Response,
            ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ::kindling::error::Result<()>> + ::std::marker::Send>> {
                ::std::boxed::Box::pin(#fn_name(req, res))
            }
        },
        "on_error" => quote! {
            fn __kindling_mw_wrapper(
                err: &::kindling::error::Error,
                req: &::kindling::request::Request,
            ) -> ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = ()> + ::std::marker::Send>> {
                ::std::boxed::Box::pin(#fn_name(err, req))
            }
        },
        _ => unreachable!(),
    };

    let output = quote! {
        #input

        #wrapper

        #[::kindling::linkme::distributed_slice(::kindling::middleware::MIDDLEWARE_REGISTRATIONS)]
        #[allow(non_upper_case_globals)]
        static #static_name: ::kindling::middleware::MiddlewareInfo = ::kindling::middleware::MiddlewareInfo {
            prefix: #prefix,
            hook: #hook,
            source: #source,
        };
    };

    output.into()
}

struct MiddlewarePrefix {
    prefix: LitStr,
}

impl Parse for MiddlewarePrefix {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let ident: Ident = input.parse()?;
        if ident != "prefix" {
            return Err(syn::Error::new(ident.span(), "expected `prefix = \"...\"`"));
        }
        input.parse::<Token![=]>()?;
        let prefix: LitStr = input.parse()?;
        Ok(MiddlewarePrefix { prefix })
    }
}

/// `#[warmup]`: registers a zero-or-one startup hook run once before the
/// listener binds (spec.md §6 `warmup.{source-ext}`, SPEC_FULL.md §5).
#[proc_macro_attribute]
pub fn warmup(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let fn_name = &input.sig.ident;
    let source = source_literal(&fn_name.to_string());
    let static_name = Ident::new(&format!("__KINDLING_WARMUP_{}", fn_name.to_string().to_ascii_uppercase()), fn_name.span());

    let output = quote! {
        #input

        #[::kindling::linkme::distributed_slice(::kindling::warmup::WARMUP_REGISTRATIONS)]
        #[allow(non_upper_case_globals)]
        static #static_name: ::kindling::warmup::WarmupInfo = ::kindling::warmup::WarmupInfo {
            source: #source,
            handler: || ::std::boxed::Box::pin(#fn_name()),
        };
    };

    output.into()
}

fn option_u64_tokens(value: Option<u64>) -> proc_macro2::TokenStream {
    match value {
        Some(v) => quote! { ::std::option::Option::Some(#v) },
        None => quote! { ::std::option::Option::None },
    }
}

fn option_u32_tokens(value: Option<u32>) -> proc_macro2::TokenStream {
    match value {
        Some(v) => quote! { ::std::option::Option::Some(#v) },
        None => quote! { ::std::option::Option::None },
    }
}

/// Diagnostic identifier for a registration (spec.md §3 "source filename",
/// §8 scenario 2's ManifestError "naming one of the files"). `file!()`/
/// `line!()` expand to this macro crate's own source location for every
/// call site, so every registration would report the same place; using
/// the handler's own identifying literal instead points a collision or
/// validation error at the actual offending handler.
fn source_literal(identifying: &str) -> LitStr {
    LitStr::new(identifying, Span::call_site())
}
