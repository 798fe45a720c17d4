//! Beneficiary directory
//!
//! Resolves where the counter-leg of an order is paid: the seller's bank
//! account for fiat payouts, the buyer's wallet for custody releases.

use async_trait::async_trait;
use common::UserId;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{SettlementError, SettlementResult};
use crate::types::BankDetails;

/// Lookup of payout destinations per user
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Bank account receiving fiat payouts for `user_id`
    async fn bank_details(&self, user_id: UserId) -> SettlementResult<BankDetails>;

    /// Wallet address receiving custody releases for `user_id`
    async fn crypto_destination(&self, user_id: UserId) -> SettlementResult<String>;
}

#[derive(Debug, Clone, Default)]
struct AccountEntry {
    bank_details: Option<BankDetails>,
    wallet_address: Option<String>,
}

/// Directory held in memory, seeded from configuration
#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    accounts: RwLock<HashMap<UserId, AccountEntry>>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `accounts` section of the master config
    pub fn from_config(accounts: &[config::AccountConfig]) -> SettlementResult<Self> {
        let directory = Self::new();
        for account in accounts {
            let user_id: UserId = account.user_id.parse().map_err(|e| {
                SettlementError::Config(format!("Invalid user id '{}': {}", account.user_id, e))
            })?;

            let bank_details = account.bank.as_ref().map(|bank| BankDetails {
                account_holder: bank.account_holder.clone(),
                account_number: bank.account_number.clone(),
                bank_code: bank.bank_code.clone(),
            });
            directory.insert(user_id, bank_details, account.wallet_address.clone());
        }
        Ok(directory)
    }

    pub fn with_bank_details(self, user_id: UserId, details: BankDetails) -> Self {
        self.accounts.write().entry(user_id).or_default().bank_details = Some(details);
        self
    }

    pub fn with_wallet(self, user_id: UserId, address: impl Into<String>) -> Self {
        self.accounts.write().entry(user_id).or_default().wallet_address = Some(address.into());
        self
    }

    pub fn insert(
        &self,
        user_id: UserId,
        bank_details: Option<BankDetails>,
        wallet_address: Option<String>,
    ) {
        self.accounts.write().insert(
            user_id,
            AccountEntry {
                bank_details,
                wallet_address,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn bank_details(&self, user_id: UserId) -> SettlementResult<BankDetails> {
        self.accounts
            .read()
            .get(&user_id)
            .and_then(|entry| entry.bank_details.clone())
            .ok_or_else(|| SettlementError::not_found(format!("bank details for user {}", user_id)))
    }

    async fn crypto_destination(&self, user_id: UserId) -> SettlementResult<String> {
        self.accounts
            .read()
            .get(&user_id)
            .and_then(|entry| entry.wallet_address.clone())
            .ok_or_else(|| SettlementError::not_found(format!("wallet for user {}", user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn details() -> BankDetails {
        BankDetails {
            account_holder: "Bob".to_string(),
            account_number: "GB29NWBK60161331926819".to_string(),
            bank_code: Some("NWBKGB2L".to_string()),
        }
    }

    #[tokio::test]
    async fn test_lookup() {
        let user = UserId::new();
        let directory = InMemoryAccountDirectory::new()
            .with_bank_details(user, details())
            .with_wallet(user, "0xfeed");

        assert_eq!(directory.bank_details(user).await.unwrap(), details());
        assert_eq!(directory.crypto_destination(user).await.unwrap(), "0xfeed");
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_entries_are_not_found() {
        let user = UserId::new();
        let directory = InMemoryAccountDirectory::new().with_wallet(user, "0xfeed");

        assert_matches!(
            directory.bank_details(user).await,
            Err(SettlementError::NotFound(_))
        );
        assert_matches!(
            directory.crypto_destination(UserId::new()).await,
            Err(SettlementError::NotFound(_))
        );
    }

    #[test]
    fn test_from_config_rejects_bad_user_id() {
        let accounts = vec![config::AccountConfig {
            user_id: "not-a-uuid".to_string(),
            bank: None,
            wallet_address: Some("0x1".to_string()),
        }];
        assert_matches!(
            InMemoryAccountDirectory::from_config(&accounts),
            Err(SettlementError::Config(_))
        );
    }

    #[test]
    fn test_from_config() {
        let user = UserId::new();
        let accounts = vec![config::AccountConfig {
            user_id: user.to_string(),
            bank: Some(config::BankAccountConfig {
                account_holder: "Bob".to_string(),
                account_number: "GB29NWBK60161331926819".to_string(),
                bank_code: None,
            }),
            wallet_address: None,
        }];
        let directory = InMemoryAccountDirectory::from_config(&accounts).unwrap();
        assert_eq!(directory.len(), 1);
    }
}
