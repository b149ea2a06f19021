use crate::utils::apply_derives;
use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Generics, Ident, Item, Result, Token, parse::Parse, parse::ParseStream, parse_macro_input};

/// #[message] 宏实现
/// - 支持结构体（具名、tuple 或单元）与枚举，不支持泛型（类型标签必须唯一）
/// - 类型标签默认取类型名，可用 `name = "..."` 覆写
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as MessageAttrConfig);
    let mut input = parse_macro_input!(item as Item);

    let required: Vec<syn::Path> = vec![
        syn::parse_quote!(Debug),
        syn::parse_quote!(Clone),
        syn::parse_quote!(serde::Serialize),
        syn::parse_quote!(serde::Deserialize),
    ];

    let (ident, generics) = match &mut input {
        Item::Struct(st) => {
            apply_derives(&mut st.attrs, required);
            (st.ident.clone(), st.generics.clone())
        }
        Item::Enum(en) => {
            apply_derives(&mut en.attrs, required);
            (en.ident.clone(), en.generics.clone())
        }
        other => {
            return syn::Error::new(other.span(), "#[message] only supports struct or enum")
                .to_compile_error()
                .into();
        }
    };

    if let Err(err) = reject_generics(&generics) {
        return err.to_compile_error().into();
    }

    let type_tag = cfg
        .name
        .unwrap_or_else(|| syn::LitStr::new(&ident.to_string(), ident.span()));

    if type_tag.value().trim().is_empty() {
        return syn::Error::new(type_tag.span(), "message name must not be empty")
            .to_compile_error()
            .into();
    }

    let expanded = quote! {
        #input

        impl ::postbus::Message for #ident {
            const TYPE: &'static str = #type_tag;
        }
    };

    TokenStream::from(expanded)
}

fn reject_generics(generics: &Generics) -> Result<()> {
    if generics.params.is_empty() {
        Ok(())
    } else {
        Err(syn::Error::new(
            generics.span(),
            "#[message] does not support generic types; each message needs its own type tag",
        ))
    }
}

// -------- parsing --------

struct MessageAttrConfig {
    name: Option<syn::LitStr>,
}

impl Parse for MessageAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        if input.is_empty() {
            return Ok(Self { name: None });
        }

        let mut name: Option<syn::LitStr> = None;
        let pairs: Punctuated<MessageAttrKv, Token![,]> = Punctuated::parse_terminated(input)?;

        for kv in pairs {
            if kv.key != "name" {
                return Err(syn::Error::new(
                    kv.key.span(),
                    "unknown key in attribute; expected 'name'",
                ));
            }
            if name.is_some() {
                return Err(syn::Error::new(
                    kv.key.span(),
                    "duplicate key 'name' in attribute",
                ));
            }
            name = Some(kv.value);
        }

        Ok(Self { name })
    }
}

struct MessageAttrKv {
    key: Ident,
    value: syn::LitStr,
}

impl Parse for MessageAttrKv {
    fn parse(input: ParseStream) -> Result<Self> {
        let key: Ident = input.parse()?;
        let _eq: Token![=] = input.parse()?;
        let value: syn::LitStr = input.parse()?;
        Ok(Self { key, value })
    }
}
