//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[timeout(secs)]` wraps a synchronous test, `#[tokio_timeout_test(secs)]`
//! an async one on a fresh current-thread runtime. Either way the body runs
//! on a watchdog thread and the test panics once `secs` (default 60) elapse.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Flavor::Tokio)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Flavor::Sync)
}

#[derive(Clone, Copy)]
enum Flavor {
    Sync,
    Tokio,
}

fn expand(attr: TokenStream, item: TokenStream, flavor: Flavor) -> TokenStream {
    match try_expand(attr.into(), item.into(), flavor) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn try_expand(attr: TokenStream2, item: TokenStream2, flavor: Flavor) -> syn::Result<TokenStream2> {
    let timeout_secs = parse_timeout(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = syn::parse2::<ItemFn>(item)?;

    let body = match flavor {
        Flavor::Sync => {
            if sig.asyncness.is_some() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "timeout attribute expects a synchronous test function",
                ));
            }
            quote! { #block }
        }
        Flavor::Tokio => {
            if sig.asyncness.is_none() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "tokio_timeout_test can only be applied to async functions",
                ));
            }
            sig.asyncness = None;
            quote! {{
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build Tokio runtime");
                runtime.block_on(async {
                    tokio::time::timeout(timeout_duration, async move #block)
                        .await
                        .expect("test timed out");
                });
            }}
        }
    };

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn parse_timeout(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse2(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated `#[test]`.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
