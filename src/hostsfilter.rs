//! Host selection predicates applied to a runner's host universe.

use anyhow::{bail, Result};
use rand::seq::SliceRandom;

use crate::config::HostSelector;
use crate::models::Host;

/// Apply one selector entry to the universe of discovered hosts.
///
/// Label filtering always narrows the candidate set first; the remaining
/// predicates pick from it. A selector with no predicate set keeps every
/// candidate, which is what pure label selectors rely on.
pub fn filter_hosts_list(hosts: &[Host], selector: &HostSelector) -> Result<Vec<Host>> {
    let mut candidates: Vec<Host> = hosts
        .iter()
        .filter(|host| matches_labels(host, selector))
        .cloned()
        .collect();
    candidates.sort_by(|a, b| a.name.cmp(&b.name));

    if let Some(name) = &selector.name {
        let found: Vec<Host> = candidates
            .into_iter()
            .filter(|host| &host.name == name)
            .collect();
        if found.is_empty() {
            bail!("no host named {name:?} in the discovered hosts list");
        }
        return Ok(found);
    }

    if selector.random {
        let want = if selector.count > 0 { selector.count } else { 1 };
        let mut rng = rand::thread_rng();
        let mut picked: Vec<Host> = candidates
            .choose_multiple(&mut rng, want.min(candidates.len()))
            .cloned()
            .collect();
        picked.sort_by(|a, b| a.name.cmp(&b.name));
        return Ok(picked);
    }

    if !selector.all && selector.count > 0 {
        candidates.truncate(selector.count);
    }

    Ok(candidates)
}

fn matches_labels(host: &Host, selector: &HostSelector) -> bool {
    match &selector.labels {
        None => true,
        Some(wanted) => wanted
            .iter()
            .all(|(k, v)| host.labels.get(k).is_some_and(|have| have == v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostSelector;

    fn universe() -> Vec<Host> {
        let mut a = Host::new("alpha");
        a.labels.insert("zone".into(), "eu".into());
        let mut b = Host::new("beta");
        b.labels.insert("zone".into(), "eu".into());
        b.labels.insert("role".into(), "storage".into());
        let c = Host::new("gamma");
        vec![c, a, b] // deliberately unsorted
    }

    #[test]
    fn all_returns_sorted_universe() {
        let sel = HostSelector {
            all: true,
            ..Default::default()
        };
        let hosts = filter_hosts_list(&universe(), &sel).unwrap();
        let names: Vec<_> = hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn count_takes_first_n_by_name() {
        let sel = HostSelector {
            count: 2,
            ..Default::default()
        };
        let hosts = filter_hosts_list(&universe(), &sel).unwrap();
        let names: Vec<_> = hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn name_selects_exactly_one() {
        let sel = HostSelector {
            name: Some("beta".into()),
            ..Default::default()
        };
        let hosts = filter_hosts_list(&universe(), &sel).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "beta");
    }

    #[test]
    fn missing_name_is_an_error() {
        let sel = HostSelector {
            name: Some("delta".into()),
            ..Default::default()
        };
        assert!(filter_hosts_list(&universe(), &sel).is_err());
    }

    #[test]
    fn labels_narrow_the_candidates() {
        let mut labels = std::collections::BTreeMap::new();
        labels.insert("zone".to_string(), "eu".to_string());
        let sel = HostSelector {
            all: true,
            labels: Some(labels),
            ..Default::default()
        };
        let hosts = filter_hosts_list(&universe(), &sel).unwrap();
        let names: Vec<_> = hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn random_respects_count_bound() {
        let sel = HostSelector {
            random: true,
            count: 2,
            ..Default::default()
        };
        let hosts = filter_hosts_list(&universe(), &sel).unwrap();
        assert_eq!(hosts.len(), 2);
    }
}
