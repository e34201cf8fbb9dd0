use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use capsync_core::{
    CoinDirectoryFields, CoinId, CoinMetadataUpdate, CoinQuoteUpdate, CoinRow, CoinStub,
    ContractAddressId, EntityCounts, LinkReport, MetadataPlan, MetadataRelations, PlatformId,
    TagId, TagKey, UrlId, UrlKey,
};
use chrono::Utc;
use tokio::sync::Mutex;

use super::{EntityStore, StoreError, StoreResult};

/// In-process store for dry runs and tests. One async mutex over all tables is
/// the single serialization point, so every operation is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    last_id: i64,
    coins: BTreeMap<i64, CoinRow>,
    platforms: HashMap<(String, CoinId), PlatformId>,
    contract_addresses: HashMap<(String, PlatformId), ContractAddressId>,
    tags: HashMap<TagKey, TagId>,
    urls: HashMap<(CoinId, UrlKey), UrlId>,
    coin_tags: BTreeSet<(CoinId, TagId)>,
    coin_urls: BTreeSet<(CoinId, UrlId)>,
    coin_contract_addresses: BTreeSet<(CoinId, ContractAddressId)>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn coin_id(&self, cap_id: i64) -> StoreResult<CoinId> {
        self.coins
            .get(&cap_id)
            .map(|row| row.id)
            .ok_or_else(|| StoreError::coin_not_found(cap_id))
    }

    fn coin_mut(&mut self, cap_id: i64) -> StoreResult<&mut CoinRow> {
        self.coins
            .get_mut(&cap_id)
            .ok_or_else(|| StoreError::coin_not_found(cap_id))
    }

    fn ensure_coin_stub(&mut self, stub: &CoinStub) -> CoinId {
        if let Some(row) = self.coins.get(&stub.cap_id) {
            return row.id;
        }

        let id = CoinId(self.next_id());
        let now = Utc::now();
        self.coins.insert(
            stub.cap_id,
            CoinRow {
                id,
                cap_id: stub.cap_id,
                name: stub.name.clone(),
                symbol: stub.symbol.clone(),
                slug: stub.slug.clone(),
                rank: None,
                is_active: None,
                first_historical_date: None,
                last_historical_date: None,
                metadata: None,
                quote: None,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    fn upsert_coin_directory(&mut self, fields: &CoinDirectoryFields) -> CoinId {
        let id = self.ensure_coin_stub(&fields.stub());
        if let Some(row) = self.coins.get_mut(&fields.cap_id) {
            row.name = fields.name.clone();
            row.symbol = Some(fields.symbol.clone());
            row.slug = Some(fields.slug.clone());
            row.rank = fields.rank;
            row.is_active = Some(fields.is_active);
            row.first_historical_date = fields.first_historical_date;
            row.last_historical_date = fields.last_historical_date;
            row.updated_at = Utc::now();
        }
        id
    }

    fn update_coin_metadata(
        &mut self,
        cap_id: i64,
        update: &CoinMetadataUpdate,
    ) -> StoreResult<CoinId> {
        let row = self.coin_mut(cap_id)?;
        let previous_logo = row.metadata.as_ref().and_then(|meta| meta.logo.clone());
        let mut stored = update.clone();
        if stored.logo.is_none() {
            stored.logo = previous_logo;
        }
        row.metadata = Some(stored);
        row.updated_at = Utc::now();
        Ok(row.id)
    }

    fn update_coin_quote(&mut self, cap_id: i64, quote: &CoinQuoteUpdate) -> StoreResult<CoinId> {
        let row = self.coin_mut(cap_id)?;
        row.quote = Some(quote.clone());
        row.updated_at = Utc::now();
        Ok(row.id)
    }

    fn upsert_platform(&mut self, name: &str, coin: CoinId) -> PlatformId {
        if let Some(id) = self.platforms.get(&(name.to_string(), coin)) {
            return *id;
        }
        let id = PlatformId(self.next_id());
        self.platforms.insert((name.to_string(), coin), id);
        id
    }

    fn upsert_contract_address(&mut self, address: &str, platform: PlatformId) -> ContractAddressId {
        if let Some(id) = self.contract_addresses.get(&(address.to_string(), platform)) {
            return *id;
        }
        let id = ContractAddressId(self.next_id());
        self.contract_addresses
            .insert((address.to_string(), platform), id);
        id
    }

    fn upsert_tag(&mut self, tag: &TagKey) -> TagId {
        if let Some(id) = self.tags.get(tag) {
            return *id;
        }
        let id = TagId(self.next_id());
        self.tags.insert(tag.clone(), id);
        id
    }

    fn upsert_url(&mut self, coin: CoinId, url: &UrlKey) -> UrlId {
        let key = (coin, url.clone());
        if let Some(id) = self.urls.get(&key) {
            return *id;
        }
        let id = UrlId(self.next_id());
        self.urls.insert(key, id);
        id
    }
}

fn link<T: Ord + Copy>(rows: &mut BTreeSet<(CoinId, T)>, coin: CoinId, others: &[T], report: &mut LinkReport) {
    for other in others {
        if rows.insert((coin, *other)) {
            report.inserted += 1;
        } else {
            report.existing += 1;
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags linked to a coin, sorted.
    pub async fn linked_tags(&self, cap_id: i64) -> Vec<TagKey> {
        let tables = self.tables.lock().await;
        let Ok(coin) = tables.coin_id(cap_id) else {
            return Vec::new();
        };
        let mut linked: Vec<TagKey> = tables
            .tags
            .iter()
            .filter(|(_, id)| tables.coin_tags.contains(&(coin, **id)))
            .map(|(key, _)| key.clone())
            .collect();
        linked.sort();
        linked
    }

    /// Platforms as `(name, owning cap_id)`, sorted.
    pub async fn platforms(&self) -> Vec<(String, i64)> {
        let tables = self.tables.lock().await;
        let mut platforms: Vec<(String, i64)> = tables
            .platforms
            .keys()
            .filter_map(|(name, coin)| {
                tables
                    .coins
                    .values()
                    .find(|row| row.id == *coin)
                    .map(|row| (name.clone(), row.cap_id))
            })
            .collect();
        platforms.sort();
        platforms
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ensure_coin_stub(&self, stub: &CoinStub) -> StoreResult<CoinId> {
        Ok(self.tables.lock().await.ensure_coin_stub(stub))
    }

    async fn upsert_coin_directory(&self, fields: &CoinDirectoryFields) -> StoreResult<CoinId> {
        Ok(self.tables.lock().await.upsert_coin_directory(fields))
    }

    async fn apply_metadata(&self, plan: &MetadataPlan) -> StoreResult<MetadataRelations> {
        let mut tables = self.tables.lock().await;
        let coin = tables.coin_id(plan.cap_id)?;

        let contract_addresses = plan
            .contracts
            .iter()
            .map(|contract| {
                let owner = tables.ensure_coin_stub(&contract.platform_coin);
                let platform = tables.upsert_platform(&contract.platform, owner);
                tables.upsert_contract_address(&contract.address, platform)
            })
            .collect();
        let tags = plan.tags.iter().map(|tag| tables.upsert_tag(tag)).collect();
        let urls = plan
            .urls
            .iter()
            .map(|url| tables.upsert_url(coin, url))
            .collect();

        tables.update_coin_metadata(plan.cap_id, &plan.update)?;

        Ok(MetadataRelations {
            cap_id: plan.cap_id,
            coin,
            tags,
            urls,
            contract_addresses,
        })
    }

    async fn link_relations(&self, relations: &MetadataRelations) -> StoreResult<LinkReport> {
        let mut guard = self.tables.lock().await;
        let tables = &mut *guard;
        if tables.coin_id(relations.cap_id)? != relations.coin {
            return Err(StoreError::coin_not_found(relations.cap_id));
        }

        let mut report = LinkReport::default();
        link(&mut tables.coin_tags, relations.coin, &relations.tags, &mut report);
        link(&mut tables.coin_urls, relations.coin, &relations.urls, &mut report);
        link(
            &mut tables.coin_contract_addresses,
            relations.coin,
            &relations.contract_addresses,
            &mut report,
        );
        Ok(report)
    }

    async fn apply_quote(&self, stub: &CoinStub, quote: &CoinQuoteUpdate) -> StoreResult<CoinId> {
        let mut tables = self.tables.lock().await;
        tables.ensure_coin_stub(stub);
        tables.update_coin_quote(stub.cap_id, quote)
    }

    async fn coin_keys(&self) -> StoreResult<Vec<i64>> {
        Ok(self.tables.lock().await.coins.keys().copied().collect())
    }

    async fn coin(&self, cap_id: i64) -> StoreResult<Option<CoinRow>> {
        Ok(self.tables.lock().await.coins.get(&cap_id).cloned())
    }

    async fn counts(&self) -> StoreResult<EntityCounts> {
        let tables = self.tables.lock().await;
        Ok(EntityCounts {
            coins: tables.coins.len() as u64,
            platforms: tables.platforms.len() as u64,
            contract_addresses: tables.contract_addresses.len() as u64,
            tags: tables.tags.len() as u64,
            urls: tables.urls.len() as u64,
            coin_tags: tables.coin_tags.len() as u64,
            coin_urls: tables.coin_urls.len() as u64,
            coin_contract_addresses: tables.coin_contract_addresses.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn stub(cap_id: i64, name: &str) -> CoinStub {
        CoinStub {
            cap_id,
            name: name.to_string(),
            symbol: None,
            slug: None,
        }
    }

    fn defi() -> TagKey {
        TagKey {
            name: "DeFi".into(),
            category: "Category".into(),
        }
    }

    fn tagged(cap_id: i64, update: CoinMetadataUpdate) -> MetadataPlan {
        MetadataPlan {
            cap_id,
            update,
            contracts: Vec::new(),
            tags: vec![defi()],
            urls: Vec::new(),
        }
    }

    #[tokio::test]
    async fn concurrent_upserts_of_one_key_create_one_row() {
        let store = Arc::new(MemoryStore::new());
        for cap_id in 1..=32 {
            store.ensure_coin_stub(&stub(cap_id, "Coin")).await.unwrap();
        }

        let mut handles = Vec::new();
        for cap_id in 1..=32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .apply_metadata(&tagged(cap_id, CoinMetadataUpdate::default()))
                    .await
            }));
        }

        let mut ids = BTreeSet::new();
        for handle in handles {
            let relations = handle.await.expect("join").expect("apply");
            ids.extend(relations.tags);
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(store.counts().await.expect("counts").tags, 1);
    }

    #[tokio::test]
    async fn stub_never_overwrites_and_directory_enriches() {
        let store = MemoryStore::new();
        let first = store.ensure_coin_stub(&stub(1027, "Ethereum")).await.unwrap();
        let again = store.ensure_coin_stub(&stub(1027, "Renamed")).await.unwrap();
        assert_eq!(first, again);

        let row = store.coin(1027).await.unwrap().expect("row");
        assert_eq!(row.name, "Ethereum");
        assert!(row.is_placeholder());

        let enriched = store
            .upsert_coin_directory(&CoinDirectoryFields {
                cap_id: 1027,
                name: "Ethereum".into(),
                symbol: "ETH".into(),
                slug: "ethereum".into(),
                rank: Some(2),
                is_active: true,
                first_historical_date: None,
                last_historical_date: None,
            })
            .await
            .unwrap();

        assert_eq!(enriched, first);
        let row = store.coin(1027).await.unwrap().expect("row");
        assert_eq!(row.rank, Some(2));
        assert!(!row.is_placeholder());
        assert_eq!(store.counts().await.unwrap().coins, 1);
    }

    #[tokio::test]
    async fn metadata_for_unknown_coin_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .apply_metadata(&tagged(42, CoinMetadataUpdate::default()))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::coin_not_found(42));
        assert_eq!(store.counts().await.unwrap().tags, 0);
    }

    #[tokio::test]
    async fn missing_logo_bytes_keep_the_stored_logo() {
        let store = MemoryStore::new();
        store.ensure_coin_stub(&stub(1, "Bitcoin")).await.unwrap();

        let with_logo = CoinMetadataUpdate {
            logo: Some(vec![0x89, 0x50]),
            description: Some("first".into()),
            ..CoinMetadataUpdate::default()
        };
        store.apply_metadata(&tagged(1, with_logo)).await.unwrap();

        let without_logo = CoinMetadataUpdate {
            description: Some("second".into()),
            ..CoinMetadataUpdate::default()
        };
        store.apply_metadata(&tagged(1, without_logo)).await.unwrap();

        let meta = store.coin(1).await.unwrap().unwrap().metadata.unwrap();
        assert_eq!(meta.description.as_deref(), Some("second"));
        assert_eq!(meta.logo, Some(vec![0x89, 0x50]));
    }

    #[tokio::test]
    async fn relinking_counts_existing_pairs() {
        let store = MemoryStore::new();
        store.ensure_coin_stub(&stub(1, "Bitcoin")).await.unwrap();
        let relations = store
            .apply_metadata(&tagged(1, CoinMetadataUpdate::default()))
            .await
            .unwrap();

        let first = store.link_relations(&relations).await.unwrap();
        let second = store.link_relations(&relations).await.unwrap();

        assert_eq!(first, LinkReport { inserted: 1, existing: 0 });
        assert_eq!(second, LinkReport { inserted: 0, existing: 1 });
        assert_eq!(store.counts().await.unwrap().coin_tags, 1);
        assert_eq!(store.linked_tags(1).await, vec![defi()]);
    }
}
