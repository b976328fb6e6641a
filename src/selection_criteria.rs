//! Read preferences and other ways of choosing the server an operation runs on.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::public::ServerInfo,
    serde_util,
};

/// How servers are chosen for an operation.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    #[allow(missing_docs)]
    #[display("ReadPreference {_0}")]
    ReadPreference(ReadPreference),

    /// Any data-bearing server the predicate accepts is eligible. In a single-server topology
    /// the predicate is consulted regardless of server type.
    #[display("Custom predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    /// Predicates never compare equal, not even to themselves.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(ours), Self::ReadPreference(theirs)) => ours == theirs,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        if let Self::ReadPreference(read_pref) = self {
            Some(read_pref)
        } else {
            None
        }
    }

    /// Accepts only the server at `address`, so a cursor's follow-up commands reach the server
    /// that holds it.
    pub(crate) fn from_address(address: ServerAddress) -> Self {
        Self::Predicate(Arc::new(move |server| *server.address() == address))
    }
}

/// A caller-supplied filter over servers.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Which replica set members a read may go to.
///
/// Every mode but `Primary` may narrow the candidates further with
/// [`ReadPreferenceOptions`].
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// The primary, and nothing else.
    Primary,

    /// Secondaries only.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// The primary while there is one, secondaries otherwise.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Secondaries while any are eligible, the primary otherwise.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Any member, primary or secondary, within the latency window.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

/// Narrows a non-primary read preference.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tried in order; the first tag set any candidate matches decides the candidates. When
    /// none matches, no secondary is eligible.
    pub tag_sets: Option<Vec<TagSet>>,

    /// How far a secondary may estimate to lag the primary and still be eligible.
    ///
    /// Selection fails if this is under 90 seconds or under the heartbeat frequency plus ten
    /// seconds.
    #[serde(
        rename = "maxStalenessSeconds",
        default,
        with = "serde_util::duration_option_as_int_seconds"
    )]
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    /// True when these options do not narrow anything. A lone empty tag set matches everyone.
    pub(crate) fn is_default(&self) -> bool {
        let tags_narrow = match self.tag_sets.as_deref() {
            None | Some([]) => false,
            Some([only]) => !only.is_empty(),
            Some(_) => true,
        };
        self.max_staleness.is_none() && !tags_narrow
    }
}

impl ReadPreference {
    /// Builds a read preference from a mode name, which is matched case-insensitively.
    pub(crate) fn from_mode(mode: &str, options: Option<ReadPreferenceOptions>) -> Result<Self> {
        if mode.eq_ignore_ascii_case("primary") {
            return match options {
                Some(options) if !options.is_default() => Err(Error::invalid_argument(format!(
                    "the primary read preference takes no options, got {:?}",
                    options
                ))),
                _ => Ok(Self::Primary),
            };
        }
        Ok(match mode.to_ascii_lowercase().as_str() {
            "secondary" => Self::Secondary { options },
            "primarypreferred" => Self::PrimaryPreferred { options },
            "secondarypreferred" => Self::SecondaryPreferred { options },
            "nearest" => Self::Nearest { options },
            _ => {
                return Err(Error::invalid_argument(format!(
                    "unknown read preference mode {:?}",
                    mode
                )))
            }
        })
    }

    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    fn options_slot(&mut self) -> Option<&mut Option<ReadPreferenceOptions>> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => Some(options),
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options()?.max_staleness
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options()?.tag_sets.as_ref()
    }

    fn with_options(
        mut self,
        what: &str,
        set: impl FnOnce(&mut ReadPreferenceOptions),
    ) -> Result<Self> {
        let slot = self.options_slot().ok_or_else(|| {
            Error::invalid_argument(format!(
                "{} requires a read preference mode other than primary",
                what
            ))
        })?;
        set(slot.get_or_insert_with(Default::default));
        Ok(self)
    }

    pub(crate) fn with_tags(self, tag_sets: Vec<TagSet>) -> Result<Self> {
        self.with_options("read preference tags", |options| {
            options.tag_sets = Some(tag_sets)
        })
    }

    pub(crate) fn with_max_staleness(self, max_staleness: Duration) -> Result<Self> {
        self.with_options("max staleness", |options| {
            options.max_staleness = Some(max_staleness)
        })
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = self.mode();
        let (first, rest) = mode.split_at(1);
        write!(f, "{{ Mode: {}{}", first.to_ascii_uppercase(), rest)?;
        if let Some(tag_sets) = self.tag_sets() {
            write!(f, ", Tag Sets: {:?}", tag_sets)?;
        }
        if let Some(max_staleness) = self.max_staleness() {
            write!(f, ", Max Staleness: {:?}", max_staleness)?;
        }
        f.write_str(" }")
    }
}

/// `{ mode, tagSets?, maxStalenessSeconds? }`, the shape `$readPreference` takes on the wire.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReadPreferenceDocument<M, O> {
    mode: M,
    #[serde(flatten)]
    options: O,
}

impl Serialize for ReadPreference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ReadPreferenceDocument {
            mode: self.mode(),
            options: self.options(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ReadPreference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let document =
            ReadPreferenceDocument::<String, ReadPreferenceOptions>::deserialize(deserializer)?;
        ReadPreference::from_mode(&document.mode, Some(document.options)).map_err(D::Error::custom)
    }
}

/// Server tags to match. A server matches when it carries every pair in the set.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{ReadPreference, ReadPreferenceOptions, TagSet};
    use crate::bson::{doc, from_document, to_document};

    #[test]
    fn serializes_mode_and_options() {
        let tags: TagSet = [("dc".to_string(), "east".to_string())].into_iter().collect();
        let read_pref = ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .tag_sets(vec![tags])
                    .max_staleness(Duration::from_secs(120))
                    .build(),
            ),
        };

        assert_eq!(
            to_document(&read_pref).unwrap(),
            doc! {
                "mode": "secondary",
                "tagSets": [{ "dc": "east" }],
                "maxStalenessSeconds": 120,
            }
        );
        assert_eq!(
            to_document(&ReadPreference::Primary).unwrap(),
            doc! { "mode": "primary" }
        );
    }

    #[test]
    fn mode_names_ignore_case() {
        let read_pref = ReadPreference::from_mode("SECONDARYpreferred", None).unwrap();
        assert_eq!(read_pref.mode(), "secondaryPreferred");
        assert!(ReadPreference::from_mode("closest", None).is_err());

        let parsed: ReadPreference = from_document(doc! { "mode": "nearest" }).unwrap();
        assert_eq!(
            parsed,
            ReadPreference::Nearest {
                options: Some(Default::default())
            }
        );
    }

    #[test]
    fn primary_rejects_options() {
        assert!(ReadPreference::Primary.with_tags(vec![TagSet::new()]).is_err());
        assert!(ReadPreference::Primary
            .with_max_staleness(Duration::from_secs(90))
            .is_err());

        let parsed =
            from_document::<ReadPreference>(doc! { "mode": "primary", "maxStalenessSeconds": 100 });
        assert!(parsed.is_err());

        let parsed = from_document::<ReadPreference>(doc! { "mode": "primary", "tagSets": [{}] });
        assert_eq!(parsed.unwrap(), ReadPreference::Primary);
    }

    #[test]
    fn display() {
        assert_eq!(
            ReadPreference::Nearest { options: None }.to_string(),
            "{ Mode: Nearest }"
        );
        let read_pref = ReadPreference::Secondary { options: None }
            .with_max_staleness(Duration::from_secs(90))
            .unwrap();
        assert_eq!(read_pref.to_string(), "{ Mode: Secondary, Max Staleness: 90s }");
    }
}
