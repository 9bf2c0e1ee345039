//! Data path parsing.
//!
//! Paths are absolute, module-qualified on the first segment and may carry
//! list-key predicates: `/mod:server/listen[name='http']/port`. Predicates
//! use single or double quotes.

use serde::{Deserialize, Serialize};
use yds_common::{YdsError, YdsResult};

/// One path segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    /// Module qualifier; mandatory on the first segment, inherited after.
    pub module: Option<String>,
    /// Node name, or "*" for a wildcard.
    pub name: String,
    /// List-key predicates.
    pub predicates: Vec<(String, String)>,
}

impl PathSegment {
    /// Whether this segment matches any node name.
    pub fn is_wildcard(&self) -> bool {
        self.name == "*"
    }
}

/// A parsed absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    /// Segments, at least one.
    pub segments: Vec<PathSegment>,
}

impl Path {
    /// Parse a path string.
    pub fn parse(s: &str) -> YdsResult<Path> {
        let invalid = |why: &str| YdsError::InvalArg {
            msg: format!("Invalid path \"{}\": {}.", s, why),
        };

        let rest = s.strip_prefix('/').ok_or_else(|| invalid("not absolute"))?;
        if rest.is_empty() {
            return Err(invalid("empty"));
        }

        let mut segments = Vec::new();
        let mut chars = rest.chars().peekable();
        loop {
            let mut ident = String::new();
            let mut module = None;
            let mut predicates = Vec::new();

            while let Some(&c) = chars.peek() {
                match c {
                    '/' | '[' => break,
                    ':' => {
                        chars.next();
                        if ident.is_empty() {
                            return Err(invalid("empty module name"));
                        }
                        module = Some(std::mem::take(&mut ident));
                    }
                    _ => {
                        chars.next();
                        ident.push(c);
                    }
                }
            }
            if ident.is_empty() {
                return Err(invalid("empty node name"));
            }

            while chars.peek() == Some(&'[') {
                chars.next();
                let mut key = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '=' {
                        break;
                    }
                    chars.next();
                    key.push(c);
                }
                if chars.next() != Some('=') {
                    return Err(invalid("predicate without '='"));
                }
                let quote = chars.next().ok_or_else(|| invalid("unterminated predicate"))?;
                if quote != '\'' && quote != '"' {
                    return Err(invalid("predicate value not quoted"));
                }
                let mut val = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => val.push(c),
                        None => return Err(invalid("unterminated quote")),
                    }
                }
                if chars.next() != Some(']') {
                    return Err(invalid("predicate without ']'"));
                }
                predicates.push((key.trim().to_string(), val));
            }

            if segments.is_empty() && module.is_none() {
                return Err(invalid("first segment must be module-qualified"));
            }
            segments.push(PathSegment {
                module,
                name: ident,
                predicates,
            });

            match chars.next() {
                None => break,
                Some('/') => continue,
                Some(c) => return Err(invalid(&format!("unexpected character '{}'", c))),
            }
        }

        Ok(Path { segments })
    }

    /// Owning module of the path (module of the first segment).
    pub fn module(&self) -> &str {
        self.segments[0]
            .module
            .as_deref()
            .unwrap_or_default()
    }

    /// Whether two paths cannot select any common node, decided purely on
    /// their segments. Returns `true` only when disjointness is certain.
    pub fn disjoint_with(&self, other: &Path) -> bool {
        let len = self.segments.len().min(other.segments.len());
        let mut module_a = "";
        let mut module_b = "";
        for i in 0..len {
            let a = &self.segments[i];
            let b = &other.segments[i];
            module_a = a.module.as_deref().unwrap_or(module_a);
            module_b = b.module.as_deref().unwrap_or(module_b);
            if module_a != module_b {
                return true;
            }
            if a.is_wildcard() || b.is_wildcard() {
                return false;
            }
            if a.name != b.name {
                return true;
            }
            for (key, val) in &a.predicates {
                if let Some((_, other_val)) = b.predicates.iter().find(|(k, _)| k == key) {
                    if val != other_val {
                        return true;
                    }
                }
            }
        }
        false
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for seg in &self.segments {
            write!(f, "/")?;
            if let Some(m) = &seg.module {
                write!(f, "{}:", m)?;
            }
            write!(f, "{}", seg.name)?;
            for (k, v) in &seg.predicates {
                write!(f, "[{}='{}']", k, v)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let p = Path::parse("/m:server/port").unwrap();
        assert_eq!(p.segments.len(), 2);
        assert_eq!(p.module(), "m");
        assert_eq!(p.segments[1].name, "port");
        assert!(p.segments[1].module.is_none());
    }

    #[test]
    fn test_parse_predicates() {
        let p = Path::parse("/m:server/listen[name='http'][port=\"80\"]/on").unwrap();
        let seg = &p.segments[1];
        assert_eq!(seg.predicates.len(), 2);
        assert_eq!(seg.predicates[0], ("name".to_string(), "http".to_string()));
        assert_eq!(seg.predicates[1], ("port".to_string(), "80".to_string()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Path::parse("m:server").is_err());
        assert!(Path::parse("/server").is_err());
        assert!(Path::parse("/m:").is_err());
        assert!(Path::parse("/m:a[k='v'").is_err());
        assert!(Path::parse("/").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["/m:a/b", "/m:a[k='v']/b", "/m:a/n:b"] {
            let p = Path::parse(s).unwrap();
            assert_eq!(p.to_string(), s);
            assert_eq!(Path::parse(&p.to_string()).unwrap(), p);
        }
    }

    #[test]
    fn test_disjoint() {
        let a = Path::parse("/m:state/counter").unwrap();
        let b = Path::parse("/m:config-only").unwrap();
        let c = Path::parse("/m:*").unwrap();
        let d = Path::parse("/n:state").unwrap();
        assert!(a.disjoint_with(&b));
        assert!(!a.disjoint_with(&c));
        assert!(a.disjoint_with(&d));
        // Same list, different key values.
        let e = Path::parse("/m:l[k='1']/x").unwrap();
        let f = Path::parse("/m:l[k='2']").unwrap();
        let g = Path::parse("/m:l/x").unwrap();
        assert!(e.disjoint_with(&f));
        assert!(!e.disjoint_with(&g));
    }
}
