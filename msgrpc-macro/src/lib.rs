//! # msgrpc procedural macros
//!
//! `#[msgrpc::service]` turns a trait of async procedures into:
//! - a `msgrpc_export` method registering every procedure with a
//!   `msgrpc::Router`;
//! - a `<Trait>Client<T>` struct with one typed stub per procedure,
//!   generic over any `msgrpc::Transport`.
//!
//! ```rust,ignore
//! #[msgrpc::service]
//! pub trait Calculator {
//!     async fn add(&self, a: i64, b: i64) -> msgrpc::Result<i64>;
//!     async fn scale(&self, value: f64, factor: Option<f64>) -> msgrpc::Result<f64>;
//! }
//! ```
//!
//! Parameters typed `Option<T>` are optional: callers may leave them out
//! and the stub omits them from the request when they are `None`. Every
//! other parameter is required. Parameters must be owned, deserializable
//! values and the return type must be `Result<R, E>` with a serializable
//! `R` and `E: Into<msgrpc::BoxError>`.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    FnArg, GenericArgument, ItemTrait, Pat, PathArguments, ReturnType, TraitItem, TraitItemFn,
    Type, parse_macro_input, spanned::Spanned,
};

const RESERVED: [&str; 4] = ["msgrpc_export", "new", "from_client", "client"];

struct Param {
    ident: syn::Ident,
    name: String,
    ty: Type,
    optional: bool,
}

struct Proc {
    ident: syn::Ident,
    name: String,
    params: Vec<Param>,
    ret: Type,
    ok: Type,
}

#[proc_macro_attribute]
pub fn service(_attr: TokenStream, input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as ItemTrait);
    match expand(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: ItemTrait) -> syn::Result<proc_macro2::TokenStream> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "service traits cannot be generic",
        ));
    }
    let krate = get_crate_name();
    let trait_ident = &input.ident;
    let trait_name = trait_ident.to_string();
    let client_ident = format_ident!("{}Client", trait_ident);
    let visibility = &input.vis;
    let attrs = &input.attrs;
    let supertraits = &input.supertraits;
    let colon = input.colon_token;

    let mut items = vec![];
    let mut procs = vec![];
    for item in &input.items {
        match item {
            TraitItem::Fn(method) => {
                let proc = parse_proc(method)?;
                items.push(rewrite_method(method, &proc.ret));
                procs.push(proc);
            }
            other => items.push(quote! { #other }),
        }
    }

    let exports = procs.iter().map(|proc| {
        let Proc {
            ident, name, params, ..
        } = proc;
        let declare = params.iter().map(|p| {
            let name = &p.name;
            if p.optional {
                quote! { .optional(#name) }
            } else {
                quote! { .required(#name) }
            }
        });
        let decode = params.iter().map(|p| {
            let Param {
                ident, name, ty, ..
            } = p;
            if p.optional {
                quote! { let #ident: #ty = __args.optional(#name)?; }
            } else {
                quote! { let #ident: #ty = __args.required(#name)?; }
            }
        });
        let idents = params.iter().map(|p| &p.ident);
        quote! {
            {
                let __this = self.clone();
                router.add_procedure(
                    #krate::Procedure::new(#name) #(#declare)*,
                    move |__args: #krate::Args| {
                        let __this = __this.clone();
                        async move {
                            #(#decode)*
                            let __rsp = __this
                                .#ident(#(#idents),*)
                                .await
                                .map_err(::core::convert::Into::<#krate::BoxError>::into)?;
                            #krate::into_value(&__rsp)
                        }
                    },
                )?;
            }
        }
    });

    let stubs = procs.iter().map(|proc| {
        let Proc {
            ident,
            name,
            params,
            ok,
            ..
        } = proc;
        let args = params.iter().map(|p| {
            let Param { ident, ty, .. } = p;
            quote! { #ident: #ty }
        });
        let insert = params.iter().map(|p| {
            let Param { ident, name, .. } = p;
            if p.optional {
                quote! {
                    if let ::core::option::Option::Some(__value) = &#ident {
                        __request.insert(#name, __value)?;
                    }
                }
            } else {
                quote! { __request.insert(#name, &#ident)?; }
            }
        });
        let doc = format!("Calls `{name}` on the remote service.");
        quote! {
            #[doc = #doc]
            pub async fn #ident(&self, #(#args),*) -> #krate::Result<#ok> {
                let mut __request = #krate::Request::new(#name);
                #(#insert)*
                self.client.invoke_as(__request).await
            }
        }
    });

    let client_doc = format!("Typed client of [`{trait_name}`].");
    Ok(quote! {
        #(#attrs)*
        #visibility trait #trait_ident #colon #supertraits {
            const NAME: &'static str = #trait_name;

            #(#items)*

            /// Registers every procedure of this service with `router`.
            fn msgrpc_export(
                self: ::std::sync::Arc<Self>,
                router: &mut #krate::Router,
            ) -> #krate::Result<()>
            where
                Self: ::core::marker::Sized + ::core::marker::Send + ::core::marker::Sync + 'static,
            {
                #(#exports)*
                ::core::result::Result::Ok(())
            }
        }

        #[doc = #client_doc]
        #[derive(Debug, Clone)]
        #visibility struct #client_ident<T> {
            client: #krate::Client<T>,
        }

        impl<T: #krate::Transport> #client_ident<T> {
            pub fn new(transport: T) -> Self {
                Self {
                    client: #krate::Client::new(transport),
                }
            }

            pub fn from_client(client: #krate::Client<T>) -> Self {
                Self { client }
            }

            pub fn client(&self) -> &#krate::Client<T> {
                &self.client
            }

            #(#stubs)*
        }
    })
}

fn parse_proc(method: &TraitItemFn) -> syn::Result<Proc> {
    let sig = &method.sig;
    let ident = sig.ident.clone();
    let name = ident.to_string();
    if RESERVED.contains(&name.as_str()) {
        return Err(syn::Error::new(
            ident.span(),
            format!("a procedure cannot be named `{name}`"),
        ));
    }
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "procedures must be `async fn`"));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            sig.generics.span(),
            "procedures cannot be generic",
        ));
    }
    match sig.receiver() {
        Some(receiver) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => {
            return Err(syn::Error::new(
                sig.span(),
                "procedures must take `&self`",
            ));
        }
    }

    let mut params = vec![];
    for input in sig.inputs.iter().skip(1) {
        let FnArg::Typed(arg) = input else {
            continue;
        };
        let Pat::Ident(pat) = arg.pat.as_ref() else {
            return Err(syn::Error::new(
                arg.pat.span(),
                "procedure parameters must be plain identifiers",
            ));
        };
        if matches!(arg.ty.as_ref(), Type::Reference(_)) {
            return Err(syn::Error::new(
                arg.ty.span(),
                "procedure parameters must be owned values",
            ));
        }
        let ident = pat.ident.clone();
        let name = ident.to_string().trim_start_matches("r#").to_string();
        params.push(Param {
            ident,
            name,
            optional: last_segment_is(&arg.ty, "Option"),
            ty: (*arg.ty).clone(),
        });
    }

    let ReturnType::Type(_, ret) = &sig.output else {
        return Err(syn::Error::new(
            sig.span(),
            "procedures must return `Result<T, E>`",
        ));
    };
    let ok = first_type_argument(ret).ok_or_else(|| {
        syn::Error::new(ret.span(), "procedures must return `Result<T, E>`")
    })?;

    Ok(Proc {
        ident,
        name,
        params,
        ret: (**ret).clone(),
        ok,
    })
}

/// `async fn f(..) -> R` becomes `fn f(..) -> impl Future<Output = R> + Send`
/// so exported procedures can run on any worker task.
fn rewrite_method(method: &TraitItemFn, ret: &Type) -> proc_macro2::TokenStream {
    let attrs = &method.attrs;
    let mut sig = method.sig.clone();
    sig.asyncness = None;
    sig.output = syn::parse_quote! {
        -> impl ::core::future::Future<Output = #ret> + ::core::marker::Send
    };
    match &method.default {
        Some(body) => quote! {
            #(#attrs)*
            #sig {
                async move #body
            }
        },
        None => quote! {
            #(#attrs)*
            #sig;
        },
    }
}

fn last_segment_is(ty: &Type, ident: &str) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == ident),
        _ => false,
    }
}

fn first_type_argument(ty: &Type) -> Option<Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    args.args.iter().find_map(|arg| match arg {
        GenericArgument::Type(ty) => Some(ty.clone()),
        _ => None,
    })
}

/// Path of the runtime crate as seen from the expansion site.
pub(crate) fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("msgrpc") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        _ => quote! { ::msgrpc },
    }
}
