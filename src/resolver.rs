//! Expansion of a pipeline's direct references and label selectors into
//! concrete resource lists. Missing references are logged and skipped so a
//! partial plan is still useful; resolution itself never fails a
//! reconciliation.

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::NamespaceResourceScope;
use kube::{api::ListParams, Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::crd::Processor;
use crate::selector;
use crate::Result;

pub struct Resolver {
    client: Client,
    namespace: String,
}

impl Resolver {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Resolve one resource kind: refs first in input order, then selector
    /// matches, deduplicated by name. Unresolvable refs are skipped.
    pub async fn resolve<K>(&self, refs: &[String], selectors: &[LabelSelector]) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.api::<K>();
        let mut resolved = Vec::new();
        for name in refs {
            match api.get_opt(name).await? {
                Some(obj) => resolved.push(obj),
                None => debug!(kind = %K::kind(&()), %name, "reference not found, skipping"),
            }
        }
        let matches = self.select::<K>(selectors).await?;
        Ok(merge_by_name(resolved, matches))
    }

    /// Processor resolution keeps ref duplicates and appends selector
    /// matches in lexicographic order, so the execution order of a
    /// processor chain is exactly what the pipeline wrote down.
    pub async fn resolve_processors(
        &self,
        refs: &[String],
        selectors: &[LabelSelector],
    ) -> Result<Vec<Processor>> {
        let api = self.api::<Processor>();
        let mut resolved = Vec::new();
        for name in refs {
            // duplicates in refs are duplicates in the chain
            match resolved
                .iter()
                .find(|p: &&Processor| p.name_any() == *name)
                .cloned()
            {
                Some(hit) => resolved.push(hit),
                None => match api.get_opt(name).await? {
                    Some(obj) => resolved.push(obj),
                    None => debug!(%name, "processor not found, skipping"),
                },
            }
        }
        let matches = self.select::<Processor>(selectors).await?;
        Ok(order_processors(resolved, matches))
    }

    async fn select<K>(&self, selectors: &[LabelSelector]) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let selectors: Vec<&LabelSelector> =
            selectors.iter().filter(|s| !selector::is_empty(s)).collect();
        if selectors.is_empty() {
            return Ok(Vec::new());
        }
        let list = self.api::<K>().list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|item| selectors.iter().any(|s| selector::matches(s, item.labels())))
            .collect())
    }
}

/// Union of refs and selector matches, deduplicated by name with refs
/// keeping their input order.
pub fn merge_by_name<K: ResourceExt>(refs: Vec<K>, matches: Vec<K>) -> Vec<K> {
    let mut out = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for obj in refs.into_iter().chain(matches) {
        if seen.insert(obj.name_any()) {
            out.push(obj);
        }
    }
    out
}

/// Chain order for processors: refs verbatim (duplicates included), then
/// selector matches sorted by name, minus anything the refs already name.
pub fn order_processors(refs: Vec<Processor>, matches: Vec<Processor>) -> Vec<Processor> {
    let ref_names: std::collections::BTreeSet<String> =
        refs.iter().map(|p| p.name_any()).collect();
    let mut tail: Vec<Processor> = matches
        .into_iter()
        .filter(|p| !ref_names.contains(&p.name_any()))
        .collect();
    tail.sort_by_key(|a| a.name_any());
    tail.dedup_by_key(|p| p.name_any());
    let mut out = refs;
    out.extend(tail);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ProcessorSpec, Target, TargetSpec};
    use kube::core::ObjectMeta;

    fn processor(name: &str) -> Processor {
        Processor {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: ProcessorSpec {
                processor_type: "event-strings".into(),
                config: None,
            },
        }
    }

    fn target(name: &str) -> Target {
        Target {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: TargetSpec {
                address: "1.1.1.1:57400".into(),
                profile: "p".into(),
            },
            status: None,
        }
    }

    fn names(procs: &[Processor]) -> Vec<String> {
        procs.iter().map(|p| p.name_any()).collect()
    }

    #[test]
    fn processor_refs_come_first_verbatim_then_sorted_matches() {
        let refs = vec![processor("c"), processor("a"), processor("c")];
        let matches = vec![processor("b"), processor("d"), processor("a"), processor("c")];
        let chain = order_processors(refs, matches);
        assert_eq!(names(&chain), vec!["c", "a", "c", "b", "d"]);
    }

    #[test]
    fn selector_only_chain_is_sorted_and_deduped() {
        let matches = vec![processor("z"), processor("m"), processor("z"), processor("a")];
        let chain = order_processors(vec![], matches);
        assert_eq!(names(&chain), vec!["a", "m", "z"]);
    }

    #[test]
    fn merge_dedups_selector_matches_against_refs() {
        let refs = vec![target("a"), target("b")];
        let matches = vec![target("b"), target("c"), target("a")];
        let merged = merge_by_name(refs, matches);
        let got: Vec<String> = merged.iter().map(|t| t.name_any()).collect();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[test]
    fn merge_keeps_ref_order() {
        let refs = vec![target("z"), target("a")];
        let merged = merge_by_name(refs, vec![]);
        let got: Vec<String> = merged.iter().map(|t| t.name_any()).collect();
        assert_eq!(got, vec!["z", "a"]);
    }
}
