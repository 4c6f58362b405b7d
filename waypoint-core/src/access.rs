//! Time-boxed, single-use access grants.
//!
//! Two independent whitelists gate subscription attempts: one keyed by
//! characterId, one by (mapId, characterId). A key may hold several
//! outstanding grants at once (concurrent login flows with distinct
//! tokens), so redemption scans the whole list for its key: every
//! expired grant it passes is dropped, a token match is consumed and
//! reported, and the scan still visits the remaining grants. Expired
//! grants on untouched keys linger until the next check for that exact
//! key or until [`AccessTokenStore::sweep_expired`] runs.

use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct CharacterGrant {
    token: String,
    expires_at: i64,
    snapshot: Value,
}

#[derive(Debug, Clone)]
struct MapGrant {
    token: String,
    expires_at: i64,
}

/// Store for both grant whitelists.
#[derive(Debug, Default)]
pub struct AccessTokenStore {
    character: HashMap<i64, Vec<CharacterGrant>>,
    map: HashMap<i64, HashMap<i64, Vec<MapGrant>>>,
}

impl AccessTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a character grant; earlier grants for the same character
    /// stay outstanding.
    pub fn issue_character_grant(
        &mut self,
        character_id: i64,
        token: impl Into<String>,
        snapshot: Value,
        expires_at: i64,
    ) {
        self.character
            .entry(character_id)
            .or_default()
            .push(CharacterGrant {
                token: token.into(),
                expires_at,
                snapshot,
            });
    }

    /// Appends a map grant scoped to (map, character).
    pub fn issue_map_grant(
        &mut self,
        map_id: i64,
        character_id: i64,
        token: impl Into<String>,
        expires_at: i64,
    ) {
        self.map
            .entry(map_id)
            .or_default()
            .entry(character_id)
            .or_default()
            .push(MapGrant {
                token: token.into(),
                expires_at,
            });
    }

    /// Redeems a character grant, returning the captured snapshot.
    ///
    /// Scans every grant for the character: expired ones are dropped, a
    /// token match is consumed, and scanning continues to the end.
    pub fn redeem_character_grant(
        &mut self,
        character_id: i64,
        token: &str,
        now: i64,
    ) -> Option<Value> {
        let grants = self.character.get_mut(&character_id)?;
        let mut snapshot = None;

        grants.retain(|grant| {
            if grant.expires_at <= now {
                return false;
            }
            if grant.token == token {
                if snapshot.is_none() {
                    snapshot = Some(grant.snapshot.clone());
                }
                return false;
            }
            true
        });

        if grants.is_empty() {
            self.character.remove(&character_id);
        }
        snapshot
    }

    /// Redeems a map grant. Identical scan rule, scoped to
    /// (mapId, characterId).
    pub fn redeem_map_grant(
        &mut self,
        map_id: i64,
        character_id: i64,
        token: &str,
        now: i64,
    ) -> bool {
        let Some(per_character) = self.map.get_mut(&map_id) else {
            return false;
        };
        let Some(grants) = per_character.get_mut(&character_id) else {
            return false;
        };
        let mut access = false;

        grants.retain(|grant| {
            if grant.expires_at <= now {
                return false;
            }
            if grant.token == token {
                access = true;
                return false;
            }
            true
        });

        if grants.is_empty() {
            per_character.remove(&character_id);
            if per_character.is_empty() {
                self.map.remove(&map_id);
            }
        }
        access
    }

    /// Drops grants whose expiry lies more than `grace` seconds in the
    /// past. Housekeeping only; redemption never depends on this.
    pub fn sweep_expired(&mut self, now: i64, grace: i64) {
        let cutoff = now - grace;
        self.character.retain(|_, grants| {
            grants.retain(|g| g.expires_at > cutoff);
            !grants.is_empty()
        });
        self.map.retain(|_, per_character| {
            per_character.retain(|_, grants| {
                grants.retain(|g| g.expires_at > cutoff);
                !grants.is_empty()
            });
            !per_character.is_empty()
        });
    }

    /// Outstanding character grants for a character, expired included.
    pub fn character_grant_count(&self, character_id: i64) -> usize {
        self.character.get(&character_id).map_or(0, Vec::len)
    }

    /// Outstanding map grants for (map, character), expired included.
    pub fn map_grant_count(&self, map_id: i64, character_id: i64) -> usize {
        self.map
            .get(&map_id)
            .and_then(|per_character| per_character.get(&character_id))
            .map_or(0, Vec::len)
    }
}
