use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use serde::de::Error as DeError;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::*;

#[derive(Error, Debug)]
pub enum OverridableError {
    #[error("Could not compile repo pattern {pattern:?} due to: {err}")]
    InvalidPattern { pattern: String, err: globset::Error },
}

/// A string field that is either a single default or a list of
/// `{match, value}` rules keyed by repository name. First matching rule
/// wins; the default applies when no rule matches.
///
#[derive(Debug, Clone, Default)]
pub struct OverridableString {
    default: String,
    only: Vec<MatchValue>,
}

#[derive(Debug, Clone)]
pub struct MatchValue {
    pattern: String,
    value: String,
    matcher: GlobMatcher,
}

impl OverridableString {
    pub fn from_default(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            only: vec![],
        }
    }

    pub fn value(&self, repo_name: &str) -> &str {
        for mv in &self.only {
            if mv.matcher.is_match(repo_name) {
                return &mv.value;
            }
        }
        &self.default
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOverridableString {
    Plain(String),
    Rules {
        #[serde(default)]
        default: String,
        #[serde(default)]
        only: Vec<RawMatchValue>,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMatchValue {
    #[serde(rename = "match")]
    pattern: String,
    value: String,
}

impl<'de> Deserialize<'de> for OverridableString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawOverridableString::deserialize(deserializer)? {
            RawOverridableString::Plain(default) => Ok(Self {
                default,
                only: vec![],
            }),
            RawOverridableString::Rules { default, only } => {
                let only = only
                    .into_iter()
                    .map(|raw| {
                        let matcher = compile_pattern(&raw.pattern).map_err(D::Error::custom)?;
                        Ok(MatchValue {
                            pattern: raw.pattern,
                            value: raw.value,
                            matcher,
                        })
                    })
                    .collect::<Result<Vec<_>, D::Error>>()?;
                Ok(Self { default, only })
            }
        }
    }
}

impl Serialize for OverridableString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.only.is_empty() {
            return serializer.serialize_str(&self.default);
        }

        let mut st = serializer.serialize_struct("OverridableString", 2)?;
        st.serialize_field("default", &self.default)?;
        let rules: Vec<_> = self
            .only
            .iter()
            .map(|mv| {
                let mut rule = std::collections::BTreeMap::new();
                rule.insert("match", mv.pattern.clone());
                rule.insert("value", mv.value.clone());
                rule
            })
            .collect();
        st.serialize_field("only", &rules)?;
        st.end()
    }
}

/// A bool field that is either a single default, or an `{only, except}`
/// pair of glob lists matched against repository names. A non-empty
/// only-list takes precedence; an empty one means "true unless excepted".
///
#[derive(Debug, Clone)]
pub struct OverridableBool {
    default: Option<bool>,
    only: Vec<String>,
    except: Vec<String>,
    only_set: GlobSet,
    except_set: GlobSet,
}

impl Default for OverridableBool {
    fn default() -> Self {
        Self {
            default: None,
            only: vec![],
            except: vec![],
            only_set: GlobSet::empty(),
            except_set: GlobSet::empty(),
        }
    }
}

impl OverridableBool {
    pub fn from_default(default: bool) -> Self {
        Self {
            default: Some(default),
            ..Default::default()
        }
    }

    pub fn from_only_except(
        only: Vec<String>,
        except: Vec<String>,
    ) -> Result<Self, OverridableError> {
        let only_set = compile_set(&only)?;
        let except_set = compile_set(&except)?;
        Ok(Self {
            default: None,
            only,
            except,
            only_set,
            except_set,
        })
    }

    pub fn value(&self, repo_name: &str) -> bool {
        if let Some(default) = self.default {
            return default;
        }

        if !self.only.is_empty() {
            return self.only_set.is_match(repo_name);
        }

        !self.except_set.is_match(repo_name)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOverridableBool {
    Plain(bool),
    OnlyExcept {
        #[serde(default)]
        only: Vec<String>,
        #[serde(default)]
        except: Vec<String>,
    },
}

impl<'de> Deserialize<'de> for OverridableBool {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawOverridableBool::deserialize(deserializer)? {
            RawOverridableBool::Plain(default) => Ok(Self::from_default(default)),
            RawOverridableBool::OnlyExcept { only, except } => {
                Self::from_only_except(only, except).map_err(D::Error::custom)
            }
        }
    }
}

impl Serialize for OverridableBool {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if let Some(default) = self.default {
            return serializer.serialize_bool(default);
        }

        let mut st = serializer.serialize_struct("OverridableBool", 2)?;
        st.serialize_field("only", &self.only)?;
        st.serialize_field("except", &self.except)?;
        st.end()
    }
}

fn compile_pattern(pattern: &str) -> Result<GlobMatcher, OverridableError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|err| OverridableError::InvalidPattern {
            pattern: pattern.to_string(),
            err,
        })
}

fn compile_set(patterns: &[String]) -> Result<GlobSet, OverridableError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| OverridableError::InvalidPattern {
            pattern: pattern.clone(),
            err,
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| OverridableError::InvalidPattern {
            pattern: patterns.join(", "),
            err,
        })
}
