//! ARN parsing.

/// A parsed `arn:partition:service:region:account-id:resource` string.
///
/// The resource part is kept verbatim; it may itself contain `:` or `/`
/// (e.g. `function:my-fn`, `table/my-table`, `stack/my-stack/uuid`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arn {
    pub arn: String,
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account_id: String,
    pub resource: String,
}

impl Arn {
    /// The trailing identifier of the resource part: `function:my-fn`
    /// yields `my-fn`, `table/my-table` yields `my-table`. A resource with
    /// no type prefix is returned as-is.
    pub fn resource_id(&self) -> &str {
        self.resource
            .split_once([':', '/'])
            .map_or(self.resource.as_str(), |(_, id)| id)
    }
}

/// Parses an ARN-shaped string, returning `None` for anything that does not
/// have the six colon-separated parts. Empty partition/region/account parts
/// are accepted (synthetic identifiers use them).
pub fn parse_arn(text: &str) -> Option<Arn> {
    let mut parts = text.splitn(6, ':');
    if parts.next()? != "arn" {
        return None;
    }
    let partition = parts.next()?.to_string();
    let service = parts.next()?.to_string();
    let region = parts.next()?.to_string();
    let account_id = parts.next()?.to_string();
    let resource = parts.next()?.to_string();
    if resource.is_empty() {
        return None;
    }
    Some(Arn {
        arn: text.to_string(),
        partition,
        service,
        region,
        account_id,
        resource,
    })
}
