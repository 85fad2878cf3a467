use anyhow::Result;

/// Domain ids the notification socket is scoped to.
///
/// Normalized on construction (trimmed, deduplicated, sorted), so two filters
/// naming the same domains compare equal regardless of input order. An empty
/// filter means "all domains visible to the user".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DomainFilter {
    ids: Vec<String>,
}

impl DomainFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized = Vec::new();
        for id in ids {
            let id = id.as_ref().trim();
            if id.is_empty() {
                continue;
            }
            crate::validate_id("domain", id)?;
            normalized.push(id.to_string());
        }
        normalized.sort();
        normalized.dedup();
        Ok(Self { ids: normalized })
    }

    pub fn parse_csv(value: &str) -> Result<Self> {
        Self::new(crate::split_csv(value))
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, domain_id: &str) -> bool {
        self.ids.iter().any(|id| id == domain_id)
    }

    /// Whether an item scoped to `domain_id` passes this filter.
    pub fn admits(&self, domain_id: Option<&str>) -> bool {
        if self.is_empty() {
            return true;
        }
        domain_id.map_or(true, |id| self.contains(id))
    }

    /// `domain_ids=a,b` or `None` for an unscoped connection.
    pub fn query_string(&self) -> Option<String> {
        if self.ids.is_empty() {
            None
        } else {
            Some(format!("domain_ids={}", self.ids.join(",")))
        }
    }
}
