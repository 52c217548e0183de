use proc_macro2::{Span, TokenStream};
use quote::{format_ident, quote, quote_spanned};
use syn::parse::Parser;

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const MACRO_NAME: &str = "fencepost::test";

/// Config used when the attribute does not build a valid one, so the
/// expansion still type-checks and the error points at the attribute.
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    worker_threads: None,
    idle: None,
};

/// For this input:
///
/// ```rust,ignore
/// #[fencepost::test(worker_threads = 2)]
/// fn frame(manager: &TaskManager) -> anyhow::Result<()> {
///     manager.execute_round()?;
///     Ok(())
/// }
/// ```
///
/// `args` is `worker_threads = 2` and `item` is the function. The function is
/// renamed and nested inside a `#[test]` wrapper that builds the manager,
/// passes it by reference and shuts it down on the way out.
pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: syn::ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args))
    };

    match config {
        Ok(config) => expand(input, config),
        Err(e) => token_stream_with_error(expand(input, DEFAULT_ERROR_CONFIG), e),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Idle {
    Yield,
    Park,
}

impl Idle {
    fn from_str(s: &str) -> Result<Idle, String> {
        match s {
            "yield" => Ok(Idle::Yield),
            "park" => Ok(Idle::Park),
            _ => Err(format!(
                "No such idle strategy `{s}`. The idle strategies are `yield` and `park`."
            )),
        }
    }
}

struct FinalConfig {
    worker_threads: Option<usize>,
    idle: Option<Idle>,
}

#[derive(Default)]
struct ConfigBuilder {
    worker_threads: Option<usize>,
    idle: Option<Idle>,
}

impl ConfigBuilder {
    fn set_worker_threads(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.worker_threads.is_some() {
            return Err(syn::Error::new(
                span,
                "`worker_threads` set multiple times.",
            ));
        }

        let worker_threads = parse_int(lit, span, "worker_threads")?;
        if worker_threads == 0 {
            return Err(syn::Error::new(span, "`worker_threads` may not be 0."));
        }
        self.worker_threads = Some(worker_threads);

        Ok(())
    }

    fn set_idle(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.idle.is_some() {
            return Err(syn::Error::new(span, "`idle` set multiple times."));
        }

        let idle = parse_string(lit, span, "idle")?;
        self.idle = Some(Idle::from_str(&idle).map_err(|err| syn::Error::new(span, err))?);

        Ok(())
    }

    fn build(self) -> FinalConfig {
        FinalConfig {
            worker_threads: self.worker_threads,
            idle: self.idle,
        }
    }
}

fn check_signature(sig: &syn::Signature) -> Result<(), syn::Error> {
    if let Some(asyncness) = sig.asyncness {
        let msg = "task threads run plain functions, remove the `async` keyword";
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    if !sig.generics.params.is_empty() {
        let msg = "test functions cannot be generic";
        return Err(syn::Error::new_spanned(&sig.generics, msg));
    }

    match sig.inputs.len() {
        1 => match &sig.inputs[0] {
            syn::FnArg::Typed(_) => Ok(()),
            receiver => Err(syn::Error::new_spanned(
                receiver,
                "expected an argument of type `&TaskManager`",
            )),
        },
        _ => {
            let msg = format!(
                "`#[{MACRO_NAME}]` functions take exactly one argument of type `&TaskManager`"
            );
            Err(syn::Error::new(sig.paren_token.span.join(), msg))
        }
    }
}

fn build_config(input: &syn::ItemFn, args: AttributeArgs) -> Result<FinalConfig, syn::Error> {
    check_signature(&input.sig)?;

    let mut config = ConfigBuilder::default();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "worker_threads" => config.set_worker_threads(lit.clone(), lit.span())?,
                    "idle" => config.set_idle(lit.clone(), lit.span())?,
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected one of: `worker_threads`, `idle`",
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let msg = match name.as_str() {
                    "worker_threads" | "idle" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    name => format!(
                        "Unknown attribute {name} is specified; expected one of: `worker_threads`, `idle`."
                    ),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    Ok(config.build())
}

fn expand(mut input: syn::ItemFn, config: FinalConfig) -> TokenStream {
    let span = input.sig.ident.span();

    let mut manager = quote_spanned! {span=>
        fencepost::runtime::Builder::new()
    };

    if let Some(v) = config.worker_threads {
        manager = quote_spanned! {span=> #manager.worker_threads(#v) };
    }

    if let Some(idle) = config.idle {
        let strategy = match idle {
            Idle::Yield => quote! { Yield },
            Idle::Park => quote! { Park },
        };
        manager = quote_spanned! {span=>
            #manager.idle_strategy(fencepost::runtime::IdleStrategy::#strategy)
        };
    }

    // The user function moves inside the wrapper under a new name, the wrapper
    // takes its name and attributes.
    let mut inner = input.clone();
    inner.attrs.clear();
    inner.vis = syn::Visibility::Inherited;
    inner.sig.ident = format_ident!("__{}_body", input.sig.ident);
    let inner_ident = &inner.sig.ident;

    let has_arg = !input.sig.inputs.is_empty();
    input.sig.inputs.clear();
    input.sig.asyncness = None;

    let call = if has_arg {
        quote! { #inner_ident(&manager) }
    } else {
        quote! { #inner_ident() }
    };

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;

    quote! {
        #(#attrs)*
        #[::core::prelude::v1::test]
        #vis #sig {
            #inner

            #[allow(clippy::expect_used)]
            let manager = #manager
                .try_build()
                .expect("Failed building the TaskManager");

            #call
        }
    }
}
