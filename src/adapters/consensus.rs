//! Static Consensus Adapter
//!
//! Implements the `Consensus` and `BucketCounter` ports from in-memory
//! tables. Heights only move when the owner sets them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::domain::ports::{BucketCounter, BucketInfo, Consensus, SpInfo, SpStoragePrice};
use crate::error::{Error, Result};
use crate::task::{ObjectInfo, StorageParams};

#[derive(Debug, Default)]
pub struct StaticConsensus {
    height: AtomicU64,
    unavailable: AtomicBool,
    params: RwLock<StorageParams>,
    sps: DashMap<String, SpInfo>,
    buckets: DashMap<String, BucketInfo>,
    objects: DashMap<(String, String), ObjectInfo>,
    free_quota: DashMap<String, u64>,
    prices: DashMap<String, SpStoragePrice>,
}

impl StaticConsensus {
    pub fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
            ..Default::default()
        }
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// Makes every query fail with `Consensus` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_storage_params(&self, params: StorageParams) {
        *self.params.write() = params;
    }

    pub fn insert_sp(&self, sp: SpInfo) {
        self.sps.insert(sp.operator_address.clone(), sp);
    }

    pub fn insert_bucket(&self, bucket: BucketInfo) {
        self.buckets.insert(bucket.bucket_name.clone(), bucket);
    }

    pub fn insert_object(&self, object: ObjectInfo) {
        self.objects.insert(
            (object.bucket_name.clone(), object.object_name.clone()),
            object,
        );
    }

    pub fn set_sp_free_quota(&self, operator: &str, quota: u64) {
        self.free_quota.insert(operator.to_string(), quota);
    }

    pub fn set_sp_price(&self, operator: &str, price: SpStoragePrice) {
        self.prices.insert(operator.to_string(), price);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Consensus("chain unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Consensus for StaticConsensus {
    async fn current_height(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn query_sp(&self, operator_address: &str) -> Result<SpInfo> {
        self.check_available()?;
        self.sps
            .get(operator_address)
            .map(|sp| sp.clone())
            .ok_or_else(|| Error::Consensus(format!("sp {} not found", operator_address)))
    }

    async fn query_bucket_info(&self, bucket_name: &str) -> Result<BucketInfo> {
        self.check_available()?;
        self.buckets
            .get(bucket_name)
            .map(|b| b.clone())
            .ok_or_else(|| Error::Consensus(format!("bucket {} not found", bucket_name)))
    }

    async fn query_object_info(&self, bucket_name: &str, object_name: &str) -> Result<ObjectInfo> {
        self.check_available()?;
        self.objects
            .get(&(bucket_name.to_string(), object_name.to_string()))
            .map(|o| o.clone())
            .ok_or_else(|| {
                Error::Consensus(format!("object {}/{} not found", bucket_name, object_name))
            })
    }

    async fn query_storage_params(&self) -> Result<StorageParams> {
        self.check_available()?;
        Ok(*self.params.read())
    }

    async fn query_sp_free_quota(&self, operator_address: &str) -> Result<u64> {
        self.check_available()?;
        Ok(self
            .free_quota
            .get(operator_address)
            .map(|q| *q)
            .unwrap_or_default())
    }

    async fn query_sp_price(&self, operator_address: &str) -> Result<SpStoragePrice> {
        self.check_available()?;
        self.prices
            .get(operator_address)
            .map(|p| p.clone())
            .ok_or_else(|| Error::Consensus(format!("no price for sp {}", operator_address)))
    }
}

#[async_trait]
impl BucketCounter for StaticConsensus {
    async fn user_buckets_count(&self, account: &str) -> Result<u64> {
        self.check_available()?;
        Ok(self.buckets.iter().filter(|b| b.owner == account).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_height_and_availability() {
        let chain = StaticConsensus::new(10);
        assert_eq!(chain.current_height().await.unwrap(), 10);
        chain.set_height(11);
        assert_eq!(chain.current_height().await.unwrap(), 11);
        chain.set_unavailable(true);
        assert_matches!(chain.current_height().await, Err(Error::Consensus(_)));
    }

    #[tokio::test]
    async fn test_bucket_count_by_owner() {
        let chain = StaticConsensus::new(1);
        for (i, owner) in ["alice", "alice", "bob"].iter().enumerate() {
            chain.insert_bucket(BucketInfo {
                id: i as u64,
                bucket_name: format!("b{}", i),
                owner: owner.to_string(),
                ..Default::default()
            });
        }
        assert_eq!(chain.user_buckets_count("alice").await.unwrap(), 2);
        assert_eq!(chain.user_buckets_count("carol").await.unwrap(), 0);
        assert_eq!(chain.query_bucket_info("b2").await.unwrap().owner, "bob");
    }

    #[tokio::test]
    async fn test_missing_entries_are_consensus_errors() {
        let chain = StaticConsensus::new(1);
        assert_matches!(chain.query_sp("0x1").await, Err(Error::Consensus(_)));
        assert_matches!(chain.query_object_info("b", "o").await, Err(Error::Consensus(_)));
        assert_eq!(chain.query_sp_free_quota("0x1").await.unwrap(), 0);
    }
}
