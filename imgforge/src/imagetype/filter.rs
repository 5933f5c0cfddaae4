//! Search terms over the catalog.
//!
//! A term is a glob (`*`, `?`, `[...]`). Plain terms match any of distro,
//! arch, image type or boot mode; `distro:`, `arch:`, `type:` and
//! `bootmode:` prefixes restrict a term to one field. An image matches when
//! every term does.

use glob::Pattern;
use thiserror::Error;

use super::ImageType;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter term {term:?}: {source}")]
    Pattern {
        term: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("unknown filter prefix {prefix:?} in {term:?}")]
    UnknownPrefix { prefix: String, term: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Any,
    Distro,
    Arch,
    Type,
    BootMode,
}

#[derive(Debug, Clone)]
struct Term {
    field: Field,
    pattern: Pattern,
}

#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    terms: Vec<Term>,
}

impl ImageFilter {
    pub fn new<S: AsRef<str>>(terms: &[S]) -> Result<Self, FilterError> {
        let terms = terms
            .iter()
            .map(|t| parse_term(t.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, image: &dyn ImageType) -> bool {
        let distro = image.distro().name;
        let arch = image.arch();
        let boot_mode = image.boot_mode();
        self.terms.iter().all(|term| {
            let hit = |value: &str| term.pattern.matches(value);
            match term.field {
                Field::Distro => hit(distro),
                Field::Arch => hit(arch.as_str()),
                Field::Type => hit(image.name()),
                Field::BootMode => hit(boot_mode.as_str()),
                Field::Any => {
                    hit(distro) || hit(arch.as_str()) || hit(image.name()) || hit(boot_mode.as_str())
                }
            }
        })
    }

    /// Matching catalog entries, in catalog order.
    pub fn apply(&self) -> Vec<super::CatalogImageType> {
        super::all()
            .into_iter()
            .filter(|it| self.matches(it))
            .collect()
    }
}

fn parse_term(term: &str) -> Result<Term, FilterError> {
    let (field, pattern) = match term.split_once(':') {
        Some((prefix, rest)) => {
            let field = match prefix {
                "distro" => Field::Distro,
                "arch" => Field::Arch,
                "type" => Field::Type,
                "bootmode" => Field::BootMode,
                other => {
                    return Err(FilterError::UnknownPrefix {
                        prefix: other.to_string(),
                        term: term.to_string(),
                    });
                }
            };
            (field, rest)
        }
        None => (Field::Any, term),
    };
    let pattern = Pattern::new(pattern).map_err(|source| FilterError::Pattern {
        term: term.to_string(),
        source,
    })?;
    Ok(Term { field, pattern })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(terms: &[&str]) -> Vec<String> {
        ImageFilter::new(terms)
            .unwrap()
            .apply()
            .iter()
            .map(|it| format!("{}:{}:{}", it.distro().name, it.arch(), it.name()))
            .collect()
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert_eq!(names(&[]).len(), super::super::all().len());
    }

    #[test]
    fn prefixed_terms_pick_one_field() {
        let hits = names(&["distro:rhel-*", "type:qcow2"]);
        assert_eq!(hits, ["rhel-9.6:aarch64:qcow2", "rhel-9.6:x86_64:qcow2"]);
    }

    #[test]
    fn plain_terms_match_any_field() {
        let hits = names(&["gce"]);
        assert_eq!(hits, ["fedora-42:x86_64:gce", "rhel-9.6:x86_64:gce"]);
        let legacy = names(&["bootmode:hybrid", "arch:aarch64"]);
        assert!(legacy.is_empty(), "{legacy:?}");
    }

    #[test]
    fn character_classes() {
        let hits = names(&["distro:fedora-42", "arch:x86_64", "type:v[hm]d*"]);
        assert_eq!(hits, ["fedora-42:x86_64:vhd", "fedora-42:x86_64:vmdk"]);
    }

    #[test]
    fn bad_terms_are_errors() {
        assert!(matches!(
            ImageFilter::new(&["color:red"]),
            Err(FilterError::UnknownPrefix { .. })
        ));
        assert!(matches!(
            ImageFilter::new(&["type:[qcow2"]),
            Err(FilterError::Pattern { .. })
        ));
    }
}
