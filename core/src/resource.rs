//! Identity of protected call targets
//!
//! A [`ResourceId`] names what a moat protects: a method, one observed
//! argument value of a method, a named group of methods, or every method
//! whose name matches a pattern. Ids are immutable and hash by content.
//!
//! The textual form (used by config sources as map keys) is:
//!
//! | variant | text                               |
//! |---------|------------------------------------|
//! | method  | `OrderService.place`               |
//! | arg     | `OrderService.place(0:tenant=acme)` |
//! | group   | `@checkout`                        |
//! | regex   | `~OrderService\..*`                |
//!
//! In method names and argument parts a backslash escapes the next
//! character. Rendering escapes `\`, `(` and `)`, an `=` in argument
//! names, and a leading `@` or `~` of a method name, so every id parses
//! back to itself. Group names and patterns are taken verbatim after their
//! prefix.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::str::FromStr;

/// Argument value that broadcasts a config to every observed value of an argument
pub const MATCH_ALL: &str = "*";

/// Identity of a protected target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceId {
    /// A plain method or named call site
    Method(String),
    /// One observed value of one argument of a method
    Arg(ArgResourceId),
    /// A named set of plain ids
    Group(String),
    /// A pattern matching many plain ids
    Regex(String),
}

/// Argument-scoped identity: method + argument position/name + observed value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgResourceId {
    pub method: String,
    pub index: usize,
    pub name: String,
    pub value: String,
}

impl ArgResourceId {
    /// Id of the method this argument belongs to
    pub fn method_id(&self) -> ResourceId {
        ResourceId::Method(self.method.clone())
    }

    /// Same argument with the match-all value
    pub fn match_all(&self) -> ArgResourceId {
        ArgResourceId {
            value: MATCH_ALL.to_string(),
            ..self.clone()
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.value == MATCH_ALL
    }

    /// True when both ids name the same argument of the same method
    pub fn same_argument(&self, other: &ArgResourceId) -> bool {
        self.method == other.method && self.index == other.index && self.name == other.name
    }
}

impl ResourceId {
    pub fn method(name: impl Into<String>) -> Self {
        ResourceId::Method(name.into())
    }

    pub fn arg(
        method: impl Into<String>,
        index: usize,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        ResourceId::Arg(ArgResourceId {
            method: method.into(),
            index,
            name: name.into(),
            value: value.into(),
        })
    }

    pub fn group(name: impl Into<String>) -> Self {
        ResourceId::Group(name.into())
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        ResourceId::Regex(pattern.into())
    }

    /// The argument part, if this is an argument-scoped id
    pub fn as_arg(&self) -> Option<&ArgResourceId> {
        match self {
            ResourceId::Arg(arg) => Some(arg),
            _ => None,
        }
    }

    /// True for ids that may own a moat cluster (method and argument ids)
    pub fn is_concrete(&self) -> bool {
        matches!(self, ResourceId::Method(_) | ResourceId::Arg(_))
    }
}

const ESCAPE: char = '\\';

fn write_escaped(f: &mut fmt::Formatter<'_>, text: &str, special: &[char]) -> fmt::Result {
    for c in text.chars() {
        if c == ESCAPE || special.contains(&c) {
            f.write_char(ESCAPE)?;
        }
        f.write_char(c)?;
    }
    Ok(())
}

fn write_method(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if name.starts_with(['@', '~']) {
        f.write_char(ESCAPE)?;
    }
    write_escaped(f, name, &['(', ')'])
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Method(name) => write_method(f, name),
            ResourceId::Arg(arg) => {
                write_method(f, &arg.method)?;
                write!(f, "({}:", arg.index)?;
                write_escaped(f, &arg.name, &['(', ')', '='])?;
                f.write_char('=')?;
                write_escaped(f, &arg.value, &['(', ')'])?;
                f.write_char(')')
            }
            ResourceId::Group(name) => write!(f, "@{}", name),
            ResourceId::Regex(pattern) => write!(f, "~{}", pattern),
        }
    }
}

/// Unescaped text up to the first unescaped `stops` character
///
/// Returns the stop character met, `None` at the end of input, and fails on
/// a dangling escape.
fn scan(chars: &mut std::str::Chars<'_>, stops: &[char]) -> Option<(String, Option<char>)> {
    let mut text = String::new();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => text.push(chars.next()?),
            c if stops.contains(&c) => return Some((text, Some(c))),
            c => text.push(c),
        }
    }
    Some((text, None))
}

/// Error parsing the textual form of a [`ResourceId`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource id '{0}'")]
pub struct ParseResourceIdError(pub String);

impl FromStr for ResourceId {
    type Err = ParseResourceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseResourceIdError(s.to_string());

        if s.is_empty() {
            return Err(invalid());
        }
        if let Some(name) = s.strip_prefix('@') {
            return if name.is_empty() {
                Err(invalid())
            } else {
                Ok(ResourceId::group(name))
            };
        }
        if let Some(pattern) = s.strip_prefix('~') {
            return if pattern.is_empty() {
                Err(invalid())
            } else {
                Ok(ResourceId::regex(pattern))
            };
        }
        let mut chars = s.chars();
        let (method, stop) = scan(&mut chars, &['(', ')']).ok_or_else(invalid)?;
        if method.is_empty() {
            return Err(invalid());
        }
        match stop {
            None => Ok(ResourceId::method(method)),
            Some('(') => {
                let (index, stop) = scan(&mut chars, &[':']).ok_or_else(invalid)?;
                if stop != Some(':') {
                    return Err(invalid());
                }
                let index = index.parse::<usize>().map_err(|_| invalid())?;
                let (name, stop) = scan(&mut chars, &['=', '(', ')']).ok_or_else(invalid)?;
                if stop != Some('=') || name.is_empty() {
                    return Err(invalid());
                }
                let (value, stop) = scan(&mut chars, &['(', ')']).ok_or_else(invalid)?;
                if stop != Some(')') || !chars.as_str().is_empty() {
                    return Err(invalid());
                }
                Ok(ResourceId::arg(method, index, name, value))
            }
            Some(_) => Err(invalid()),
        }
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ParseResourceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_form_round_trips_each_variant() {
        for id in [
            ResourceId::method("OrderService.place"),
            ResourceId::arg("OrderService.place", 0, "tenant", "acme"),
            ResourceId::group("checkout"),
            ResourceId::regex(r"OrderService\..*"),
            ResourceId::method("OrderService.place()"),
            ResourceId::method("@admin"),
            ResourceId::method("~tilde"),
            ResourceId::method(r"C:\jobs"),
            ResourceId::arg("svc", 0, "query", "f(x)"),
            ResourceId::arg("svc", 1, "a=b", r"trailing\"),
            ResourceId::arg("@svc()", 2, "key", "(("),
        ] {
            let text = id.to_string();
            assert_eq!(text.parse::<ResourceId>().unwrap(), id, "{}", text);
        }
    }

    #[test]
    fn test_arg_value_may_contain_separators() {
        let id: ResourceId = "svc.call(2:key=a=b:c)".parse().unwrap();
        assert_eq!(id, ResourceId::arg("svc.call", 2, "key", "a=b:c"));
    }

    #[test]
    fn test_escaped_text_form() {
        assert_eq!(
            ResourceId::arg("svc", 0, "query", "f(x)").to_string(),
            r"svc(0:query=f\(x\))"
        );
        assert_eq!(ResourceId::method("@admin").to_string(), r"\@admin");
        assert_eq!(
            r"\@admin".parse::<ResourceId>().unwrap(),
            ResourceId::method("@admin")
        );
    }

    #[test]
    fn test_malformed_ids_are_rejected() {
        assert!("".parse::<ResourceId>().is_err());
        assert!("@".parse::<ResourceId>().is_err());
        assert!("svc.call(x:key=1)".parse::<ResourceId>().is_err());
        assert!("svc.call(1:key)".parse::<ResourceId>().is_err());
        assert!("svc.call(1:key=v)tail".parse::<ResourceId>().is_err());
        assert!("svc.call)".parse::<ResourceId>().is_err());
        assert!(r"svc\".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_match_all_keeps_argument_identity() {
        let id = ResourceId::arg("svc.call", 1, "user", "42");
        let arg = id.as_arg().unwrap();
        let all = arg.match_all();

        assert!(all.is_match_all());
        assert!(all.same_argument(arg));
        assert_eq!(arg.method_id(), ResourceId::method("svc.call"));
    }

    #[test]
    fn test_serde_uses_text_form() {
        let id = ResourceId::arg("svc.call", 0, "user", "7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"svc.call(0:user=7)\"");
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_config_keys_survive_json() {
        let map = std::collections::HashMap::from([
            (ResourceId::arg("svc", 0, "query", "f(x)"), 1u32),
            (ResourceId::method("OrderService.place()"), 2),
            (ResourceId::method("@admin"), 3),
        ]);
        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::HashMap<ResourceId, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
