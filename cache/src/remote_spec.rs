/// Which wire surface a remote speaks (§3 Data Model). A spec of `All` is instantiated as both
/// an index remote and a storage remote, sharing the same `url`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemoteKind {
    Index,
    Storage,
    All,
}

/// A single configured remote, as collected from the command line, a project override, a
/// project's own config, or the global config (§4.8 "setup"). Two specs with identical fields
/// are the same remote regardless of which source produced them, which is what makes the
/// `Hash`/`Eq` derive below meaningful: it's the key `setup` dedupes and instantiates-once by.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteSpec {
    pub url: String,
    pub push: bool,
    pub instance_name: Option<String>,
    pub server_cert: Option<Vec<u8>>,
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
    pub kind: RemoteKind,
}

impl RemoteSpec {
    pub fn is_index(&self) -> bool {
        matches!(self.kind, RemoteKind::Index | RemoteKind::All)
    }

    pub fn is_storage(&self) -> bool {
        matches!(self.kind, RemoteKind::Storage | RemoteKind::All)
    }
}

/// Removes duplicate specs, keeping the first occurrence of each (§4.8's dedup-preserving-order
/// requirement, so that a command-line spec that also appears in project config is only
/// instantiated once and keeps the priority of its first mention).
pub fn dedupe_specs(specs: Vec<RemoteSpec>) -> Vec<RemoteSpec> {
    let mut seen = std::collections::HashSet::new();
    specs.into_iter().filter(|spec| seen.insert(spec.clone())).collect()
}

/// The four places a project's remotes can come from, in priority order (§4.8 "setup"):
/// command-line remotes are implicitly push-enabled and apply to every project; the rest are
/// already scoped to a specific project by the caller.
#[derive(Clone, Debug, Default)]
pub struct SpecSources {
    pub command_line: Vec<RemoteSpec>,
    pub project_overrides: Vec<RemoteSpec>,
    pub project_config: Vec<RemoteSpec>,
    pub global: Vec<RemoteSpec>,
}

impl SpecSources {
    /// Flattens the four sources into the order `setup` should try them in, then dedupes.
    pub fn collect(&self) -> Vec<RemoteSpec> {
        let mut all = Vec::with_capacity(
            self.command_line.len() + self.project_overrides.len() + self.project_config.len() + self.global.len(),
        );
        all.extend(self.command_line.iter().cloned());
        all.extend(self.project_overrides.iter().cloned());
        all.extend(self.project_config.iter().cloned());
        all.extend(self.global.iter().cloned());
        dedupe_specs(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(url: &str, kind: RemoteKind) -> RemoteSpec {
        RemoteSpec {
            url: url.to_owned(),
            push: false,
            instance_name: None,
            server_cert: None,
            client_cert: None,
            client_key: None,
            kind,
        }
    }

    #[test]
    fn is_index_and_is_storage_match_kind() {
        assert!(spec("a", RemoteKind::Index).is_index());
        assert!(!spec("a", RemoteKind::Index).is_storage());

        assert!(spec("a", RemoteKind::Storage).is_storage());
        assert!(!spec("a", RemoteKind::Storage).is_index());

        assert!(spec("a", RemoteKind::All).is_index());
        assert!(spec("a", RemoteKind::All).is_storage());
    }

    #[test]
    fn dedupe_specs_keeps_first_occurrence_and_preserves_order() {
        let a = spec("a", RemoteKind::Index);
        let b = spec("b", RemoteKind::Storage);
        let a_again = spec("a", RemoteKind::Index);

        let deduped = dedupe_specs(vec![a.clone(), b.clone(), a_again]);
        assert_eq!(deduped, vec![a, b]);
    }

    #[test]
    fn specs_that_differ_only_by_push_are_distinct() {
        let mut pushable = spec("a", RemoteKind::Index);
        pushable.push = true;
        let not_pushable = spec("a", RemoteKind::Index);

        let deduped = dedupe_specs(vec![pushable.clone(), not_pushable.clone()]);
        assert_eq!(deduped, vec![pushable, not_pushable]);
    }

    #[test]
    fn spec_sources_collect_orders_command_line_first_and_dedupes_across_sources() {
        let cli = spec("shared", RemoteKind::All);
        let override_only = spec("override-only", RemoteKind::Index);
        let shared_again = spec("shared", RemoteKind::All);
        let global_only = spec("global-only", RemoteKind::Storage);

        let sources = SpecSources {
            command_line: vec![cli.clone()],
            project_overrides: vec![override_only.clone(), shared_again],
            project_config: vec![],
            global: vec![global_only.clone()],
        };

        assert_eq!(sources.collect(), vec![cli, override_only, global_only]);
    }

    #[test]
    fn spec_sources_collect_is_empty_when_nothing_configured() {
        assert!(SpecSources::default().collect().is_empty());
    }
}
