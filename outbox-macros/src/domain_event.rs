use crate::utils::apply_derives;
use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Expr, Ident, Item, Result, Token, parse::Parse, parse::ParseStream, parse_macro_input};

/// #[domain_event] 宏实现
/// - 合并派生：Debug, Clone, PartialEq, Serialize, Deserialize
/// - 生成 `::outbox_core::domain_event::EventPayload` 实现，事件类型默认 `Enum.Variant`
/// - 变体可覆写：`#[event(event_type = "...")]`
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "#[domain_event] takes no arguments; override per variant with #[event(event_type = \"...\")]",
        )
        .to_compile_error()
        .into();
    }
    let mut input = parse_macro_input!(item as Item);

    let enum_item = match &mut input {
        Item::Enum(e) => e,
        other => {
            return syn::Error::new(
                other.span(),
                "#[domain_event] can only be used on enum types",
            )
            .to_compile_error()
            .into();
        }
    };

    if enum_item.variants.is_empty() {
        return syn::Error::new(enum_item.span(), "#[domain_event] requires at least one variant")
            .to_compile_error()
            .into();
    }

    let required: Vec<syn::Path> = vec![
        syn::parse_quote!(Debug),
        syn::parse_quote!(Clone),
        syn::parse_quote!(PartialEq),
        syn::parse_quote!(serde::Serialize),
        syn::parse_quote!(serde::Deserialize),
    ];
    apply_derives(&mut enum_item.attrs, required);

    let enum_ident = enum_item.ident.clone();
    let mut type_match_arms = Vec::with_capacity(enum_item.variants.len());

    for v in &mut enum_item.variants {
        let mut retained_attrs = Vec::new();
        let mut type_lit: Option<syn::LitStr> = None;

        for attr in v.attrs.iter() {
            if !attr.path().is_ident("event") {
                retained_attrs.push(attr.clone());
                continue;
            }
            match parse_variant_event_type(attr) {
                Ok(lit) if type_lit.is_some() => {
                    return syn::Error::new(
                        lit.span(),
                        "duplicate 'event_type' specified for this variant",
                    )
                    .to_compile_error()
                    .into();
                }
                Ok(lit) => type_lit = Some(lit),
                Err(err) => return err.to_compile_error().into(),
            }
        }
        v.attrs = retained_attrs;

        let v_ident = &v.ident;
        let lit = type_lit.unwrap_or_else(|| {
            syn::LitStr::new(&format!("{enum_ident}.{v_ident}"), v_ident.span())
        });
        type_match_arms.push(quote! { Self::#v_ident { .. } => #lit });
    }

    let (impl_generics, ty_generics, where_clause) = enum_item.generics.split_for_impl();

    let out = quote! {
        #enum_item

        impl #impl_generics ::outbox_core::domain_event::EventPayload for #enum_ident #ty_generics #where_clause {
            fn event_type(&self) -> &str {
                match self { #( #type_match_arms, )* }
            }
        }
    };

    TokenStream::from(out)
}

// -------- parsing --------

fn parse_variant_event_type(attr: &syn::Attribute) -> Result<syn::LitStr> {
    let syn::Meta::List(_) = &attr.meta else {
        return Err(syn::Error::new(
            attr.span(),
            "expected #[event(event_type = \"...\")]",
        ));
    };

    let pairs =
        attr.parse_args_with(Punctuated::<VariantEventAttrKv, Token![,]>::parse_terminated)?;
    let mut ty: Option<syn::LitStr> = None;

    for kv in pairs {
        if kv.key != "event_type" {
            return Err(syn::Error::new(kv.key.span(), "unknown key; expected 'event_type'"));
        }
        if ty.is_some() {
            return Err(syn::Error::new(
                kv.key.span(),
                "duplicate key 'event_type' in attribute",
            ));
        }
        match kv.value {
            Expr::Lit(syn::ExprLit {
                lit: syn::Lit::Str(lit),
                ..
            }) if !lit.value().trim().is_empty() => ty = Some(lit),
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "expected non-empty string literal for 'event_type'",
                ));
            }
        }
    }

    ty.ok_or_else(|| syn::Error::new(attr.span(), "missing 'event_type'"))
}

struct VariantEventAttrKv {
    key: Ident,
    value: Expr,
}

impl Parse for VariantEventAttrKv {
    fn parse(input: ParseStream) -> Result<Self> {
        let key = input.parse()?;
        input.parse::<Token![=]>()?;
        Ok(Self {
            key,
            value: input.parse()?,
        })
    }
}
