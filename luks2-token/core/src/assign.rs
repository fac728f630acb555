//! Token to keyslot assignments.
//!
//! An assignment lives in the `keyslots` array of the token record. Bulk
//! operations work on a snapshot of the token map and put it back on the
//! first failure, so callers see either every assignment or none.

use crate::device::CryptDevice;
use crate::error::{Result, TokenError};
use crate::header::{self, MAX_KEYSLOTS, MAX_TOKENS, Target};

impl CryptDevice {
    fn assign_one_keyslot(&mut self, token: u32, keyslot: u32, bind: bool) -> Result<()> {
        log::debug!(
            "Keyslot {keyslot} {} token {token}.",
            if bind { "assigned to" } else { "unassigned from" }
        );

        if bind && self.header.keyslot(keyslot).is_none() {
            log::debug!("Keyslot {keyslot} is not active.");
            return Err(TokenError::InvalidArgument);
        }

        let list = self
            .header
            .token_mut(token)
            .and_then(|record| record.get_mut("keyslots"))
            .ok_or(TokenError::InvalidArgument)?;

        let done = if bind {
            header::push_id(list, keyslot)
        } else {
            header::remove_id(list, keyslot)
        };

        if done {
            Ok(())
        } else {
            Err(TokenError::InvalidArgument)
        }
    }

    fn assign_one_token(&mut self, keyslot: Target, token: u32, bind: bool) -> Result<()> {
        if self.header.token(token).is_none() {
            log::debug!("Token {token} is not active.");
            return Err(TokenError::InvalidArgument);
        }

        match keyslot {
            Target::Any => {
                for keyslot in self.header.keyslot_ids() {
                    self.assign_one_keyslot(token, keyslot, bind)?;
                }
                Ok(())
            }
            Target::Id(keyslot) => self.assign_one_keyslot(token, keyslot, bind),
        }
    }

    /// Bind (`bind = true`) or unbind `keyslot` and `token`.
    ///
    /// `Target::Any` on either side expands to every existing entry.
    /// Unbinding a pair that is not bound succeeds without a change.
    pub fn token_assign(&mut self, keyslot: Target, token: Target, bind: bool) -> Result<()> {
        if matches!(keyslot, Target::Id(id) if id >= MAX_KEYSLOTS)
            || matches!(token, Target::Id(id) if id >= MAX_TOKENS)
        {
            return Err(TokenError::InvalidArgument);
        }

        let snapshot = self.header.tokens_snapshot();

        let result = match token {
            Target::Any => self
                .header
                .token_ids()
                .into_iter()
                .try_for_each(|token| self.assign_one_token(keyslot, token, bind)),
            Target::Id(token) => self.assign_one_token(keyslot, token, bind),
        };

        let result = result.and_then(|()| self.header.check_json_size());
        if result.is_err() {
            self.header.restore_tokens(snapshot);
        }
        result
    }

    pub fn token_is_assigned(&self, keyslot: u32, token: u32) -> Result<bool> {
        if keyslot >= MAX_KEYSLOTS || token >= MAX_TOKENS {
            return Err(TokenError::InvalidArgument);
        }

        Ok(self.token_keyslots(token).contains(&keyslot))
    }

    /// Keyslots bound to `token`, in assignment order.
    pub fn token_keyslots(&self, token: u32) -> Vec<u32> {
        self.header
            .token(token)
            .and_then(|record| header::id_list(record.get("keyslots")))
            .unwrap_or_default()
    }

    /// Bind `to_keyslot` to every token bound to `from_keyslot`.
    pub fn token_assignment_copy(&mut self, from_keyslot: u32, to_keyslot: u32) -> Result<()> {
        if from_keyslot >= MAX_KEYSLOTS || to_keyslot >= MAX_KEYSLOTS {
            return Err(TokenError::InvalidArgument);
        }

        let tokens: Vec<u32> = self
            .header
            .token_ids()
            .into_iter()
            .filter(|token| self.token_keyslots(*token).contains(&from_keyslot))
            .collect();

        if tokens.is_empty() {
            return Ok(());
        }

        let snapshot = self.header.tokens_snapshot();
        let result = tokens
            .into_iter()
            .try_for_each(|token| self.assign_one_token(Target::Id(to_keyslot), token, true))
            .and_then(|()| self.header.check_json_size());

        if result.is_err() {
            self.header.restore_tokens(snapshot);
        }
        result
    }

    /// Forget `keyslot` in every token record.
    pub(crate) fn drop_keyslot_assignments(&mut self, keyslot: u32) {
        for token in self.header.token_ids() {
            if let Some(list) = self
                .header
                .token_mut(token)
                .and_then(|record| record.get_mut("keyslots"))
            {
                header::remove_id(list, keyslot);
            }
        }
    }
}
