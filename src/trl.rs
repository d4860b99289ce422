//! Transfer-Rate-Limit engine (§4.D): `afd.trl` group parsing, membership
//! resolution and per-process bandwidth partitioning.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::status::{FsaStore, StatusError};

/// TRL errors.
#[derive(Debug, Error)]
pub enum TrlError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid limit value {0:?} in group {1:?}")]
    InvalidLimit(String, String),

    #[error("status store error: {0}")]
    Status(#[from] StatusError),
}

/// One `[group-name]` section of `afd.trl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrlGroup {
    pub name: String,
    /// Raw member patterns, e.g. `host1`, `web*`.
    pub members: Vec<String>,
    /// Group limit, already converted to KiB/s.
    pub limit_kib: i64,
}

impl TrlGroup {
    /// Whether `host_alias` matches one of this group's member patterns
    /// (`*`/`?` wildcards).
    #[must_use]
    pub fn matches(&self, host_alias: &str) -> bool {
        self.members.iter().any(|pattern| glob_match(pattern, host_alias))
    }
}

/// Translates a `*?`-wildcard pattern into an anchored regex.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    if !pattern.contains(['*', '?']) {
        return pattern == candidate;
    }
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map(|r| r.is_match(candidate)).unwrap_or(false)
}

/// Parses `afd.trl` contents into its groups. Unknown lines are ignored.
/// `limit = N` is bytes-per-second on disk, stored internally as KiB/s
/// (integer divide by 1024).
pub fn parse(text: &str) -> Result<Vec<TrlGroup>, TrlError> {
    let mut groups: Vec<TrlGroup> = Vec::new();
    let mut current: Option<TrlGroup> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(group) = current.take() {
                groups.push(group);
            }
            current = Some(TrlGroup {
                name: name.to_string(),
                members: Vec::new(),
                limit_kib: 0,
            });
            continue;
        }

        let Some(group) = current.as_mut() else {
            continue; // key=value before any [group] header: ignored
        };

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            match key {
                "members" => {
                    group.members = value.split(',').map(|s| s.trim().to_string()).collect();
                }
                "limit" => {
                    let bytes_per_sec: i64 = value
                        .parse()
                        .map_err(|_| TrlError::InvalidLimit(value.to_string(), group.name.clone()))?;
                    group.limit_kib = bytes_per_sec / 1024;
                }
                _ => {} // unknown keys ignored
            }
        }
    }
    if let Some(group) = current.take() {
        groups.push(group);
    }
    Ok(groups)
}

/// Resolves which group (if any) a host belongs to, honouring "a host may
/// appear in only one group; if it recurs, the later mention logs a
/// warning and the first wins".
#[must_use]
pub fn resolve_host_group<'a>(host_alias: &str, groups: &'a [TrlGroup]) -> Option<&'a TrlGroup> {
    let mut found: Option<&TrlGroup> = None;
    for group in groups {
        if group.matches(host_alias) {
            if found.is_some() {
                warn!(host_alias, group = %group.name, "host already assigned to an earlier TRL group, ignoring");
                continue;
            }
            found = Some(group);
        }
    }
    found
}

/// A loaded TRL configuration plus the mtime it was loaded at, for the
/// `check_trl_file` reload-on-change policy.
#[derive(Debug, Clone)]
pub struct TrlConfig {
    pub groups: Vec<TrlGroup>,
    loaded_mtime: Option<SystemTime>,
}

impl TrlConfig {
    /// Parses `afd.trl` from disk, recording the mtime observed for
    /// `check_trl_file`'s reload-on-change policy.
    #[instrument(skip(path))]
    pub fn load(path: &Path) -> Result<Self, TrlError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let mtime = fs::metadata(path).ok().and_then(|m| m.modified().ok());
                Ok(Self {
                    groups: parse(&text)?,
                    loaded_mtime: mtime,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self {
                groups: Vec::new(),
                loaded_mtime: None,
            }),
            Err(source) => Err(TrlError::Io { path: path.to_path_buf(), source }),
        }
    }

    /// `init_trl_data()`: unconditional first load plus an immediate
    /// publish of every host's share. `sf_xxx`/`gf_xxx` run one burst per
    /// process, so there is no later `check_trl_file` tick to catch a share
    /// that was never published — this entry point is what a freshly
    /// started worker calls instead.
    #[instrument(skip(fsa))]
    pub async fn init_trl_data(path: &Path, fsa: &FsaStore) -> Result<Self, TrlError> {
        let config = Self::load(path)?;
        config.recompute_and_publish(fsa).await?;
        Ok(config)
    }

    /// `check_trl_file()`: reloads if the file's mtime changed or it
    /// vanished (which resets all group-induced limits), then recomputes
    /// and publishes `calc_trl_per_process`/`calc_trl_solo` for every host.
    /// Returns whether a reload happened.
    #[instrument(skip(self, path, fsa))]
    pub async fn check_trl_file(&mut self, path: &Path, fsa: &FsaStore) -> Result<bool, TrlError> {
        let reloaded = self.check_and_reload(path)?;
        if reloaded {
            self.recompute_and_publish(fsa).await?;
        }
        Ok(reloaded)
    }

    /// `check_trl_file()`'s non-publishing half, kept for callers (and
    /// tests) that only care whether the file changed.
    #[instrument(skip(self, path))]
    pub fn check_and_reload(&mut self, path: &Path) -> Result<bool, TrlError> {
        let current_mtime = fs::metadata(path).ok().and_then(|m| m.modified().ok());
        if current_mtime == self.loaded_mtime {
            return Ok(false);
        }
        *self = Self::load(path)?;
        Ok(true)
    }

    /// Recomputes `calc_trl_per_process`/`calc_trl_solo` for every host
    /// known to `fsa` and writes the result back via
    /// [`FsaStore::set_trl_per_process`] — the publish step the
    /// redistribution algorithm was missing.
    #[instrument(skip(self, fsa))]
    pub async fn recompute_and_publish(&self, fsa: &FsaStore) -> Result<(), TrlError> {
        let hosts = fsa.all_hosts().await?;
        let inputs: Vec<HostTrlInput> = hosts.iter().map(HostTrlInput::from_record).collect();

        let mut by_group: HashMap<&str, Vec<&HostTrlInput>> = HashMap::new();
        let mut solo: Vec<&HostTrlInput> = Vec::new();
        for input in &inputs {
            match resolve_host_group(&input.host_alias, &self.groups) {
                Some(group) => by_group.entry(group.name.as_str()).or_default().push(input),
                None => solo.push(input),
            }
        }

        for (group_name, members) in &by_group {
            let group = self
                .groups
                .iter()
                .find(|g| g.name == *group_name)
                .expect("group name came from resolve_host_group over self.groups");

            if let [only] = members.as_slice() {
                let share = calc_trl_solo(only, Some(group.limit_kib));
                fsa.set_trl_per_process(only.pos, share).await?;
                continue;
            }

            let owned: Vec<HostTrlInput> = members.iter().map(|h| (*h).clone()).collect();
            let shares = calc_trl_per_process(group.limit_kib, &owned);
            for host in members {
                let share = shares.get(&host.host_alias).copied().unwrap_or(0);
                fsa.set_trl_per_process(host.pos, share).await?;
            }
        }

        for host in &solo {
            let share = calc_trl_solo(host, None);
            fsa.set_trl_per_process(host.pos, share).await?;
        }

        Ok(())
    }
}

/// Per-host input to [`calc_trl_per_process`]: the host's own
/// `transfer_rate_limit` (0 if unset) and its *net* active transfers
/// (raw `active_transfers` minus keep-connected-idle slots, §4.D).
#[derive(Debug, Clone)]
pub struct HostTrlInput {
    pub pos: i64,
    pub host_alias: String,
    pub transfer_rate_limit: i64,
    pub net_active_transfers: i64,
}

impl HostTrlInput {
    fn from_record(record: &crate::status::FsaRecord) -> Self {
        let idle_slots = record.job_status.iter().filter(|j| j.is_keep_connected_idle()).count() as i64;
        Self {
            pos: record.pos,
            host_alias: record.host_alias.clone(),
            transfer_rate_limit: record.transfer_rate_limit,
            net_active_transfers: (record.active_transfers - idle_slots).max(0),
        }
    }
}

/// Computes `trl_per_process` for every host in `group`, per the
/// freeze-and-redistribute algorithm of §4.D. Hosts with zero net active
/// transfers are excluded from the pool and get no entry.
#[must_use]
pub fn calc_trl_per_process(group_limit_kib: i64, hosts: &[HostTrlInput]) -> HashMap<String, i64> {
    let active: Vec<&HostTrlInput> = hosts.iter().filter(|h| h.net_active_transfers > 0).collect();

    let mut shares: HashMap<String, i64> = HashMap::new();
    for h in &active {
        let guess = if h.transfer_rate_limit > 0 {
            (h.transfer_rate_limit / h.net_active_transfers).max(1)
        } else {
            0
        };
        shares.insert(h.host_alias.clone(), guess);
    }

    let mut a: i64 = active.iter().map(|h| h.net_active_transfers).sum();
    let mut limit = group_limit_kib;
    let mut frozen: std::collections::HashSet<String> = std::collections::HashSet::new();

    while a > 1 {
        let tmp = limit / a;
        let newly_frozen: Vec<&&HostTrlInput> = active
            .iter()
            .filter(|h| !frozen.contains(&h.host_alias) && shares[&h.host_alias] < tmp)
            .collect();

        if newly_frozen.is_empty() {
            for h in &active {
                if !frozen.contains(&h.host_alias) {
                    shares.insert(h.host_alias.clone(), tmp);
                }
            }
            break;
        }

        for h in newly_frozen {
            frozen.insert(h.host_alias.clone());
            a -= h.net_active_transfers;
            limit -= h.transfer_rate_limit;
        }
    }

    shares
}

/// `calc_trl_per_process` for a host with no group, or the sole member of
/// one. The design notes require the computed share always be published,
/// never left as a dead local.
#[must_use]
pub fn calc_trl_solo(host: &HostTrlInput, group_limit_kib: Option<i64>) -> i64 {
    match group_limit_kib {
        Some(limit) => limit.min(host.transfer_rate_limit),
        None if host.net_active_transfers > 0 => host.transfer_rate_limit / host.net_active_transfers,
        None => host.transfer_rate_limit,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_groups_and_converts_limit_to_kib() {
        let text = "[fast]\nmembers = h1,h2\nlimit = 10485760\n[slow]\nmembers = h3\nlimit = 1024\n";
        let groups = parse(text).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "fast");
        assert_eq!(groups[0].members, vec!["h1", "h2"]);
        assert_eq!(groups[0].limit_kib, 10485760 / 1024);
        assert_eq!(groups[1].limit_kib, 1);
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let text = "[g]\nmembers = h1\nbogus = true\nlimit = 2048\n";
        let groups = parse(text).unwrap();
        assert_eq!(groups[0].limit_kib, 2);
    }

    #[test]
    fn wildcard_members_match() {
        let group = TrlGroup {
            name: "web".into(),
            members: vec!["web*".into()],
            limit_kib: 100,
        };
        assert!(group.matches("web01"));
        assert!(!group.matches("db01"));
    }

    #[test]
    fn first_group_wins_on_duplicate_membership() {
        let groups = vec![
            TrlGroup { name: "a".into(), members: vec!["h1".into()], limit_kib: 10 },
            TrlGroup { name: "b".into(), members: vec!["h1".into()], limit_kib: 20 },
        ];
        let resolved = resolve_host_group("h1", &groups).unwrap();
        assert_eq!(resolved.name, "a");
    }

    #[test]
    fn scenario_3_two_hosts_split_group_limit_evenly() {
        let hosts = vec![
            HostTrlInput { pos: 0, host_alias: "h1".into(), transfer_rate_limit: 0, net_active_transfers: 2 },
            HostTrlInput { pos: 1, host_alias: "h2".into(), transfer_rate_limit: 0, net_active_transfers: 2 },
        ];
        let shares = calc_trl_per_process(10240, &hosts);
        assert_eq!(shares["h1"], 2560);
        assert_eq!(shares["h2"], 2560);
    }

    #[test]
    fn hosts_below_share_are_frozen_and_removed_from_pool() {
        let hosts = vec![
            HostTrlInput { pos: 0, host_alias: "tiny".into(), transfer_rate_limit: 100, net_active_transfers: 1 },
            HostTrlInput { pos: 1, host_alias: "big".into(), transfer_rate_limit: 0, net_active_transfers: 3 },
        ];
        let shares = calc_trl_per_process(10000, &hosts);
        // tiny's initial guess (100) is below 10000/4==2500, so it freezes at 100.
        assert_eq!(shares["tiny"], 100);
        // remaining pool: limit=10000-100=9900, a=3 -> tmp=3300
        assert_eq!(shares["big"], 3300);
    }

    #[test]
    fn solo_member_takes_min_of_own_and_group_limit() {
        let host = HostTrlInput { pos: 0, host_alias: "solo".into(), transfer_rate_limit: 5000, net_active_transfers: 1 };
        assert_eq!(calc_trl_solo(&host, Some(2000)), 2000);
        assert_eq!(calc_trl_solo(&host, Some(9000)), 5000);
    }

    #[test]
    fn solo_without_group_divides_by_active_transfers() {
        let host = HostTrlInput { pos: 0, host_alias: "solo".into(), transfer_rate_limit: 4000, net_active_transfers: 4 };
        assert_eq!(calc_trl_solo(&host, None), 1000);
    }

    #[test]
    fn check_and_reload_detects_missing_file_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("afd.trl");
        std::fs::write(&path, "[g]\nmembers=h1\nlimit=1024\n").unwrap();

        let mut config = TrlConfig::load(&path).unwrap();
        assert_eq!(config.groups.len(), 1);

        std::fs::remove_file(&path).unwrap();
        let changed = config.check_and_reload(&path).unwrap();
        assert!(changed);
        assert!(config.groups.is_empty());
    }

    #[tokio::test]
    async fn recompute_and_publish_writes_group_shares_back_to_fsa() {
        let db = crate::db::AfdDb::new_in_memory().await.unwrap();
        let store = FsaStore::new(db.pool().clone());
        let pos_a = store.create_if_absent("h1").await.unwrap();
        let pos_b = store.create_if_absent("h2").await.unwrap();
        sqlx::query("UPDATE fsa_hosts SET active_transfers = 2 WHERE pos = ?")
            .bind(pos_a)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE fsa_hosts SET active_transfers = 2 WHERE pos = ?")
            .bind(pos_b)
            .execute(db.pool())
            .await
            .unwrap();

        let config = TrlConfig {
            groups: vec![TrlGroup { name: "g".into(), members: vec!["h1".into(), "h2".into()], limit_kib: 10240 }],
            loaded_mtime: None,
        };
        config.recompute_and_publish(&store).await.unwrap();

        let a = store.attach_for_read(pos_a).await.unwrap();
        let b = store.attach_for_read(pos_b).await.unwrap();
        assert_eq!(a.trl_per_process, 2560);
        assert_eq!(b.trl_per_process, 2560);
    }

    #[tokio::test]
    async fn recompute_and_publish_gives_solo_host_its_own_limit() {
        let db = crate::db::AfdDb::new_in_memory().await.unwrap();
        let store = FsaStore::new(db.pool().clone());
        let pos = store.create_if_absent("solo").await.unwrap();
        sqlx::query("UPDATE fsa_hosts SET active_transfers = 1, transfer_rate_limit = 4000 WHERE pos = ?")
            .bind(pos)
            .execute(db.pool())
            .await
            .unwrap();

        let config = TrlConfig { groups: Vec::new(), loaded_mtime: None };
        config.recompute_and_publish(&store).await.unwrap();

        let record = store.attach_for_read(pos).await.unwrap();
        assert_eq!(record.trl_per_process, 4000);
    }

    #[tokio::test]
    async fn check_trl_file_only_publishes_on_reload() {
        let db = crate::db::AfdDb::new_in_memory().await.unwrap();
        let store = FsaStore::new(db.pool().clone());
        let pos = store.create_if_absent("solo").await.unwrap();
        sqlx::query("UPDATE fsa_hosts SET active_transfers = 1, transfer_rate_limit = 500 WHERE pos = ?")
            .bind(pos)
            .execute(db.pool())
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("afd.trl");

        let mut config = TrlConfig::init_trl_data(&path, &store).await.unwrap();
        let record = store.attach_for_read(pos).await.unwrap();
        assert_eq!(record.trl_per_process, 500);

        let reloaded = config.check_trl_file(&path, &store).await.unwrap();
        assert!(!reloaded);
    }
}
