//! Helper macros for developing weir plugins
//!
//! Plugin factories are stored in the registry as
//! `fn(Value) -> Pin<Box<dyn Future<Output = Result<ExecutionType, Error>> + Send>>`
//! so that construction may perform async work (opening files, binding
//! sockets). Most factories are plain synchronous code; this attribute
//! rewrites a `fn(conf: Value) -> Result<ExecutionType, Error>` into the
//! pinned-future signature the registry expects.
use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::{parse_macro_input, parse_str, ItemFn, ReturnType};

/// Converts a synchronous plugin factory into the boxed-future form used by
/// the plugin registry.
///
/// ```ignore
/// #[weir_plugin_factory]
/// fn create_console(conf: Value) -> Result<ExecutionType, Error> {
///     Ok(ExecutionType::Producer(Box::new(Console::default())))
/// }
/// ```
#[proc_macro_attribute]
pub fn weir_plugin_factory(_attr: TokenStream, input: TokenStream) -> TokenStream {
    let func = parse_macro_input!(input as ItemFn);
    assert!(
        func.sig.asyncness.is_none(),
        "weir_plugin_factory wraps synchronous factories; write the boxed future by hand for async construction"
    );

    let vis = func.vis.clone();
    let name = func.sig.ident.clone();
    let inputs = func.sig.inputs.clone();
    let boxed: ReturnType = parse_str(
        "-> std::pin::Pin<Box<dyn core::future::Future<Output = Result<ExecutionType, Error>> + Send>>",
    )
    .expect("return type parses");

    let mut body = proc_macro2::TokenStream::new();
    for stmt in func.block.stmts {
        body.extend(stmt.to_token_stream());
    }

    quote! {
        #vis fn #name(#inputs) #boxed {
            Box::pin(async move {
                #body
            })
        }
    }
    .into()
}
