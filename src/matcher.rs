//! Include/exclude wildcard matching for resource identifiers.
//!
//! Filtering applies to the identifying string of each resource family
//! (domain names, ARNs of functions/topics/queues, bucket names, stack ids).

use anyhow::{Context, Result};
use glob::Pattern;

/// A compiled include/exclude filter.
///
/// The filter is a disjunction of groups: a text matches when any group
/// accepts it. Each include pattern forms one group together with every
/// exclude pattern as a negation; with no include patterns there is a single
/// exclude-only group that accepts everything not excluded.
#[derive(Debug, Clone)]
pub struct Matcher {
    groups: Vec<MatchGroup>,
}

#[derive(Debug, Clone)]
struct MatchGroup {
    include: Option<Pattern>,
    excludes: Vec<Pattern>,
}

impl MatchGroup {
    fn matches(&self, text: &str) -> bool {
        self.include.as_ref().map_or(true, |p| p.matches(text))
            && !self.excludes.iter().any(|p| p.matches(text))
    }
}

/// Builds a [`Matcher`] from include and exclude wildcard pattern lists.
/// Blank patterns are discarded; a malformed pattern is an error.
pub fn build_include_exclude_matcher(include: &[String], exclude: &[String]) -> Result<Matcher> {
    let compile = |pattern: &String| {
        Pattern::new(pattern).with_context(|| format!("Invalid wildcard pattern '{pattern}'"))
    };

    let includes = include
        .iter()
        .filter(|p| !p.is_empty())
        .map(compile)
        .collect::<Result<Vec<_>>>()?;
    let excludes = exclude
        .iter()
        .filter(|p| !p.is_empty())
        .map(compile)
        .collect::<Result<Vec<_>>>()?;

    let groups = if includes.is_empty() {
        vec![MatchGroup {
            include: None,
            excludes,
        }]
    } else {
        includes
            .into_iter()
            .map(|inc| MatchGroup {
                include: Some(inc),
                excludes: excludes.clone(),
            })
            .collect()
    };

    Ok(Matcher { groups })
}

impl Matcher {
    /// Whether `text` survives the filter. Empty text never matches.
    pub fn matches(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        self.groups.iter().any(|group| group.matches(text))
    }
}
