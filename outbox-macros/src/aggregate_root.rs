use crate::utils::{apply_derives, field_type, has_field, prepend_missing_fields};
use proc_macro::TokenStream;
use quote::quote;
use syn::ext::IdentExt;
use syn::spanned::Spanned;
use syn::{
    Field, Ident, Item, LitStr, Result, Token, Type, parse::Parse, parse::ParseStream,
    parse_macro_input,
};

/// #[aggregate_root] 宏实现
/// - 注入字段：`id: IdType`（缺失时）、`deleted: bool`、`recorder: EventRecorder`（不参与序列化）
/// - 合并派生：Debug, Default, Serialize, Deserialize
/// - 生成 `Entity` 与 `Aggregate` 实现
/// - 参数：`type = "..."`（默认结构体名）、`id = IdType`（默认 `String`）
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as AggregateRootAttr);
    let input = parse_macro_input!(item as Item);

    let mut st = match input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(other.span(), "#[aggregate_root] only on struct")
                .to_compile_error()
                .into();
        }
    };

    let fields = match &mut st.fields {
        syn::Fields::Named(f) => f,
        _ => {
            return syn::Error::new(st.span(), "#[aggregate_root] only supports named-field struct")
                .to_compile_error()
                .into();
        }
    };

    if has_field(fields, "recorder") {
        return syn::Error::new(
            fields.span(),
            "field `recorder` is reserved by #[aggregate_root]",
        )
        .to_compile_error()
        .into();
    }

    // 已有 id 字段时沿用其类型
    let id_type: Type = match (field_type(fields, "id"), cfg.id_ty) {
        (Some(existing), Some(declared))
            if quote!(#existing).to_string() != quote!(#declared).to_string() =>
        {
            return syn::Error::new(
                declared.span(),
                "`id` type conflicts with the existing `id` field",
            )
            .to_compile_error()
            .into();
        }
        (Some(existing), _) => existing,
        (None, Some(declared)) => declared,
        (None, None) => syn::parse_quote! { String },
    };

    let id_field: Field = syn::parse_quote! { id: #id_type };
    let deleted_field: Field = syn::parse_quote! { #[serde(default)] deleted: bool };
    let recorder_field: Field = syn::parse_quote! {
        #[serde(skip)]
        recorder: ::outbox_core::domain_event::EventRecorder
    };
    prepend_missing_fields(
        fields,
        vec![
            ("id", id_field),
            ("deleted", deleted_field),
            ("recorder", recorder_field),
        ],
    );

    let required: Vec<syn::Path> = vec![
        syn::parse_quote!(Debug),
        syn::parse_quote!(Default),
        syn::parse_quote!(serde::Serialize),
        syn::parse_quote!(serde::Deserialize),
    ];
    apply_derives(&mut st.attrs, required);

    let ident = &st.ident;
    let type_lit = cfg
        .aggregate_type
        .unwrap_or_else(|| LitStr::new(&ident.to_string(), ident.span()));
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();

    let out = quote! {
        #st

        impl #impl_generics ::outbox_core::entity::Entity for #ident #ty_generics #where_clause {
            type Id = #id_type;

            fn new(id: Self::Id) -> Self {
                Self {
                    id,
                    ..::std::default::Default::default()
                }
            }

            fn id(&self) -> &Self::Id {
                &self.id
            }
        }

        impl #impl_generics ::outbox_core::aggregate::Aggregate for #ident #ty_generics #where_clause {
            const TYPE: &'static str = #type_lit;

            fn recorder(&self) -> &::outbox_core::domain_event::EventRecorder {
                &self.recorder
            }

            fn recorder_mut(&mut self) -> &mut ::outbox_core::domain_event::EventRecorder {
                &mut self.recorder
            }

            fn is_deleted(&self) -> bool {
                self.deleted
            }

            fn set_deleted(&mut self, deleted: bool) {
                self.deleted = deleted;
            }
        }
    };

    TokenStream::from(out)
}

// 解析键值参数：type = "..."、id = <Type>
struct AggregateRootAttr {
    aggregate_type: Option<LitStr>,
    id_ty: Option<Type>,
}

impl Parse for AggregateRootAttr {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut aggregate_type: Option<LitStr> = None;
        let mut id_ty: Option<Type> = None;

        while !input.is_empty() {
            // `type` 是关键字，需要 parse_any
            let key = Ident::parse_any(input)?;
            input.parse::<Token![=]>()?;

            match key.to_string().as_str() {
                "type" => {
                    if aggregate_type.is_some() {
                        return Err(syn::Error::new(key.span(), "duplicate key 'type'"));
                    }
                    let lit: LitStr = input.parse()?;
                    if lit.value().trim().is_empty() {
                        return Err(syn::Error::new(lit.span(), "'type' must not be empty"));
                    }
                    aggregate_type = Some(lit);
                }
                "id" => {
                    if id_ty.is_some() {
                        return Err(syn::Error::new(key.span(), "duplicate key 'id'"));
                    }
                    id_ty = Some(input.parse()?);
                }
                _ => {
                    return Err(syn::Error::new(
                        key.span(),
                        "unknown key; expected 'type' | 'id'",
                    ));
                }
            }

            if input.is_empty() {
                break;
            }
            input.parse::<Token![,]>()?;
        }

        Ok(Self { aggregate_type, id_ty })
    }
}
