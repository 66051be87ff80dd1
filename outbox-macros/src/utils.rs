use quote::ToTokens;
use syn::{Attribute, Field, FieldsNamed, Token, Type, punctuated::Punctuated};

// 提取非 derive 属性与已有 derive 列表
pub(crate) fn split_derives(attrs: &[Attribute]) -> (Vec<Attribute>, Vec<syn::Path>) {
    let mut retained = Vec::new();
    let mut existing = Vec::new();
    for attr in attrs.iter() {
        if attr.path().is_ident("derive") {
            if let Ok(list) =
                attr.parse_args_with(Punctuated::<syn::Path, Token![,]>::parse_terminated)
            {
                existing.extend(list);
            }
        } else {
            retained.push(attr.clone());
        }
    }
    (retained, existing)
}

// 归一化 derive 的 key，避免 Serialize/serde::Serialize 重复
fn derive_key(p: &syn::Path) -> String {
    match p.segments.last() {
        Some(last) => last.ident.to_string(),
        None => p.to_token_stream().to_string(),
    }
}

/// 合并用户已有的 derive 与宏要求的 derive（去重，required 在前）
pub(crate) fn apply_derives(attrs: &mut Vec<Attribute>, required: Vec<syn::Path>) {
    let (retained, existing) = split_derives(attrs);

    let mut seen = std::collections::HashSet::<String>::new();
    let merged: Vec<syn::Path> = required
        .into_iter()
        .chain(existing)
        .filter(|p| seen.insert(derive_key(p)))
        .collect();

    let derive: Attribute = syn::parse_quote!(#[derive(#(#merged),*)]);
    *attrs = std::iter::once(derive).chain(retained).collect();
}

pub(crate) fn has_field(fields: &FieldsNamed, name: &str) -> bool {
    find_field(fields, name).is_some()
}

pub(crate) fn find_field<'a>(fields: &'a FieldsNamed, name: &str) -> Option<&'a Field> {
    fields
        .named
        .iter()
        .find(|f| f.ident.as_ref().is_some_and(|i| i == name))
}

/// 在字段最前插入缺失的字段，已存在的保持原位
pub(crate) fn prepend_missing_fields(fields: &mut FieldsNamed, required: Vec<(&str, Field)>) {
    let mut new_named: Punctuated<Field, Token![,]> = Punctuated::new();
    for (name, field) in required {
        if !has_field(fields, name) {
            new_named.push(field);
        }
    }
    new_named.extend(fields.named.iter().cloned());
    fields.named = new_named;
}

/// 字段类型（若存在）
pub(crate) fn field_type(fields: &FieldsNamed, name: &str) -> Option<Type> {
    find_field(fields, name).map(|f| f.ty.clone())
}
