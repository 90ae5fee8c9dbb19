// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Layout of the coordination tree. Everything here is a pure function of its arguments.
//!
//! ```text
//! <root>/<tenant>/txids/tx<10 digits>            creation timestamp
//! <root>/<tenant>/txids/tx<seq>/xg               present iff cross-group
//! <root>/<tenant>/txids/tx<seq>/lockpath         held lock paths joined by !XG_LIST!
//! <root>/<tenant>/txids/tx<seq>/ukey<seq>        "<encoded key>/<txid>"
//! <root>/<tenant>/txids/blacklist/<txid>
//! <root>/<tenant>/txids/validlist/<encoded key>  last valid txid of the key
//! <root>/<tenant>/locks/<encoded group>          holder txid, or ordered contenders below
//! <root>/<tenant>/gclock                         ephemeral
//! <root>/<tenant>/gclast_time                    unix time of the last sweep
//! ```

use coordination_client::{join_path, SEQUENCE_DIGITS};
use url::form_urlencoded;
use uuid::Uuid;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::keys::{EntityKey, TxId};

pub const DEFAULT_ROOT_PATH: &str = "/appscale/apps";

/// Singleton locks of the maintenance jobs, taken with `get_lock_with_path`.
pub const GROOMER_LOCK_PATH: &str = "/appscale_datastore_groomer";
pub const BACKUP_LOCK_PATH: &str = "/appscale_datastore_backup";
pub const RESTORE_LOCK_PATH: &str = "/appscale_datastore_restore";

pub const TX_PREFIX: &str = "tx";
pub const TX_XG: &str = "xg";
pub const TX_LOCK_LIST: &str = "lockpath";
pub const TX_UPDATED_KEY_PREFIX: &str = "ukey";
pub const LOCK_LIST_SEPARATOR: &str = "!XG_LIST!";
pub const CONTENDER_MARKER: &str = "__lock__";

const TXIDS: &str = "txids";
const BLACKLIST: &str = "blacklist";
const VALIDLIST: &str = "validlist";
const LOCKS: &str = "locks";
const GC_LOCK: &str = "gclock";
const GC_LAST_TIME: &str = "gclast_time";

/// Encodes an arbitrary string as a single path segment.
pub fn encode_segment(raw: &str) -> String {
    form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

pub fn decode_segment(encoded: &str) -> String {
    form_urlencoded::parse(format!("k={encoded}").as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

/// `tx0000000042` -> `42`.
pub fn parse_txid(name: &str) -> Option<TxId> {
    let digits = name.strip_prefix(TX_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Whether a child of `txids` is a transaction node, as opposed to the blacklist or
/// validlist namespaces.
pub fn is_transaction_node(name: &str) -> bool {
    name.strip_prefix(TX_PREFIX)
        .and_then(|rest| rest.bytes().next())
        .is_some_and(|b| b.is_ascii_digit())
}

pub fn transaction_node_name(txid: TxId) -> String {
    format!("{TX_PREFIX}{txid:0width$}", width = SEQUENCE_DIGITS)
}

/// Prefix of the contender nodes created by one ordered acquisition attempt.
pub fn contender_prefix(attempt: Uuid) -> String {
    format!("{}{CONTENDER_MARKER}", attempt.simple())
}

pub fn is_contender_of(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix)
}

pub fn join_lock_list(paths: &[String]) -> String {
    paths.join(LOCK_LIST_SEPARATOR)
}

pub fn split_lock_list(value: &str) -> Vec<String> {
    value
        .split(LOCK_LIST_SEPARATOR)
        .filter(|path| !path.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn encode_updated_key(key: &EntityKey, target: TxId) -> String {
    format!("{}/{target}", encode_segment(&key.to_string()))
}

pub fn decode_updated_key(value: &str) -> CoordinatorResult<(EntityKey, TxId)> {
    let invalid = || CoordinatorError::InvalidKey {
        key: value.to_owned(),
        reason: "malformed updated key record".to_owned(),
    };
    let (key, target) = value.rsplit_once('/').ok_or_else(invalid)?;
    let target = target.parse().map_err(|_| invalid())?;
    Ok((decode_segment(key).parse()?, target))
}

pub fn parse_txid_value(value: &str) -> Option<TxId> {
    value.trim().parse().ok()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathScheme {
    root: String,
}

impl Default for PathScheme {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_PATH)
    }
}

impl PathScheme {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn tenant_root(&self, tenant: &str) -> String {
        join_path(&self.root, &encode_segment(tenant))
    }

    pub fn txid_root(&self, tenant: &str) -> String {
        join_path(&self.tenant_root(tenant), TXIDS)
    }

    /// Path handed to sequential creation when allocating an id.
    pub fn transaction_prefix(&self, tenant: &str) -> String {
        join_path(&self.txid_root(tenant), TX_PREFIX)
    }

    pub fn transaction(&self, tenant: &str, txid: TxId) -> String {
        join_path(&self.txid_root(tenant), &transaction_node_name(txid))
    }

    pub fn xg(&self, tenant: &str, txid: TxId) -> String {
        join_path(&self.transaction(tenant, txid), TX_XG)
    }

    pub fn lock_list(&self, tenant: &str, txid: TxId) -> String {
        join_path(&self.transaction(tenant, txid), TX_LOCK_LIST)
    }

    pub fn updated_key_prefix(&self, tenant: &str, txid: TxId) -> String {
        join_path(&self.transaction(tenant, txid), TX_UPDATED_KEY_PREFIX)
    }

    pub fn blacklist_root(&self, tenant: &str) -> String {
        join_path(&self.txid_root(tenant), BLACKLIST)
    }

    pub fn blacklist(&self, tenant: &str, txid: TxId) -> String {
        join_path(&self.blacklist_root(tenant), &txid.to_string())
    }

    pub fn validlist_root(&self, tenant: &str) -> String {
        join_path(&self.txid_root(tenant), VALIDLIST)
    }

    pub fn valid_version(&self, tenant: &str, key: &EntityKey) -> String {
        join_path(
            &self.validlist_root(tenant),
            &encode_segment(&key.to_string()),
        )
    }

    pub fn locks_root(&self, tenant: &str) -> String {
        join_path(&self.tenant_root(tenant), LOCKS)
    }

    /// Lock namespace of the entity group `key` belongs to.
    pub fn group_lock(&self, tenant: &str, key: &EntityKey) -> String {
        join_path(
            &self.locks_root(tenant),
            &encode_segment(&key.entity_group().to_string()),
        )
    }

    pub fn gc_lock(&self, tenant: &str) -> String {
        join_path(&self.tenant_root(tenant), GC_LOCK)
    }

    pub fn gc_last_time(&self, tenant: &str) -> String {
        join_path(&self.tenant_root(tenant), GC_LAST_TIME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_layout() {
        let paths = PathScheme::default();
        let key: EntityKey = "Guestbook:1/Greeting:2".parse().unwrap();

        assert_eq!(
            paths.transaction("guestbook", 42),
            "/appscale/apps/guestbook/txids/tx0000000042"
        );
        assert_eq!(
            paths.xg("guestbook", 42),
            "/appscale/apps/guestbook/txids/tx0000000042/xg"
        );
        assert_eq!(
            paths.lock_list("guestbook", 42),
            "/appscale/apps/guestbook/txids/tx0000000042/lockpath"
        );
        assert_eq!(
            paths.blacklist("guestbook", 42),
            "/appscale/apps/guestbook/txids/blacklist/42"
        );
        assert_eq!(
            paths.valid_version("guestbook", &key),
            "/appscale/apps/guestbook/txids/validlist/Guestbook%3A1%2FGreeting%3A2"
        );
        assert_eq!(
            paths.group_lock("guestbook", &key),
            "/appscale/apps/guestbook/locks/Guestbook%3A1"
        );
        assert_eq!(paths.gc_lock("guestbook"), "/appscale/apps/guestbook/gclock");
        assert_eq!(PathScheme::new("/custom/").root(), "/custom");
    }

    #[test]
    fn test_segments_stay_single() {
        let encoded = encode_segment("my app/ns|Kind::a b!");
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('!'));
        assert_eq!(decode_segment(&encoded), "my app/ns|Kind::a b!");
    }

    #[test]
    fn test_transaction_names() {
        assert_eq!(parse_txid("tx0000000042"), Some(42));
        assert_eq!(parse_txid("tx"), None);
        assert_eq!(parse_txid("blacklist"), None);
        assert!(is_transaction_node("tx0000000001"));
        assert!(!is_transaction_node("txids"));
        assert!(!is_transaction_node("validlist"));
    }

    #[test]
    fn test_lock_list_and_updated_keys() {
        let list = vec!["/a/locks/x".to_owned(), "/a/locks/y".to_owned()];
        assert_eq!(split_lock_list(&join_lock_list(&list)), list);
        assert!(split_lock_list("").is_empty());

        let key: EntityKey = "ns|Guestbook:1/Greeting::a".parse().unwrap();
        let record = encode_updated_key(&key, 17);
        assert_eq!(decode_updated_key(&record).unwrap(), (key, 17));
        assert!(decode_updated_key("garbage").is_err());
    }
}
