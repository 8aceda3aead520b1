//! Admin aggregation projections: offers grouped by canonical country or
//! service with per-provider breakdown, price range, stock, and freshness.
//! Derived by in-memory grouping over the same index the resolver reads.

use std::collections::BTreeMap;

use serde::Serialize;

use numio_core::{Money, NumioError, Offer, Timestamp};

use crate::index::{OfferQuery, SearchIndex, SortBy};

#[derive(Clone, Debug, Serialize)]
pub struct ProviderBreakdown {
    pub provider: String,
    pub offers: u32,
    pub min_price: Money,
    pub max_price: Money,
    pub stock: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CountryOverview {
    pub country_name: String,
    pub offers: u32,
    pub services: u32,
    pub min_price: Money,
    pub max_price: Money,
    pub stock: u64,
    pub freshest_at: Timestamp,
    pub providers: Vec<ProviderBreakdown>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceOverview {
    pub service_name: String,
    pub offers: u32,
    pub countries: u32,
    pub min_price: Money,
    pub max_price: Money,
    pub stock: u64,
    pub freshest_at: Timestamp,
    pub providers: Vec<ProviderBreakdown>,
}

async fn all_active(index: &dyn SearchIndex) -> Result<Vec<Offer>, NumioError> {
    let offers = index
        .search(OfferQuery { sort: SortBy::PriceAsc, limit: 0, ..Default::default() })
        .await?;
    Ok(offers.into_iter().filter(|o| o.active).collect())
}

fn breakdown(offers: &[&Offer]) -> Vec<ProviderBreakdown> {
    let mut by_provider: BTreeMap<String, ProviderBreakdown> = BTreeMap::new();
    for offer in offers {
        let entry = by_provider
            .entry(offer.provider_id.as_str().to_string())
            .or_insert_with(|| ProviderBreakdown {
                provider: offer.provider_id.as_str().to_string(),
                offers: 0,
                min_price: offer.price,
                max_price: offer.price,
                stock: 0,
            });
        entry.offers += 1;
        entry.min_price = entry.min_price.min(offer.price);
        entry.max_price = entry.max_price.max(offer.price);
        entry.stock += offer.stock as u64;
    }
    by_provider.into_values().collect()
}

/// Offers grouped by canonical country name.
pub async fn countries_overview(
    index: &dyn SearchIndex,
) -> Result<Vec<CountryOverview>, NumioError> {
    let offers = all_active(index).await?;
    let mut by_country: BTreeMap<String, Vec<&Offer>> = BTreeMap::new();
    for offer in &offers {
        by_country.entry(offer.country_name.clone()).or_default().push(offer);
    }
    Ok(by_country
        .into_iter()
        .map(|(country_name, group)| {
            let mut services: Vec<&str> =
                group.iter().map(|o| o.service_name.as_str()).collect();
            services.sort_unstable();
            services.dedup();
            CountryOverview {
                country_name,
                offers: group.len() as u32,
                services: services.len() as u32,
                min_price: group.iter().map(|o| o.price).min().unwrap_or(Money::ZERO),
                max_price: group.iter().map(|o| o.price).max().unwrap_or(Money::ZERO),
                stock: group.iter().map(|o| o.stock as u64).sum(),
                freshest_at: group.iter().map(|o| o.updated_at).max().unwrap_or(0),
                providers: breakdown(&group),
            }
        })
        .collect())
}

/// Offers grouped by canonical service name.
pub async fn services_overview(
    index: &dyn SearchIndex,
) -> Result<Vec<ServiceOverview>, NumioError> {
    let offers = all_active(index).await?;
    let mut by_service: BTreeMap<String, Vec<&Offer>> = BTreeMap::new();
    for offer in &offers {
        by_service.entry(offer.service_name.clone()).or_default().push(offer);
    }
    Ok(by_service
        .into_iter()
        .map(|(service_name, group)| {
            let mut countries: Vec<&str> =
                group.iter().map(|o| o.country_name.as_str()).collect();
            countries.sort_unstable();
            countries.dedup();
            ServiceOverview {
                service_name,
                offers: group.len() as u32,
                countries: countries.len() as u32,
                min_price: group.iter().map(|o| o.price).min().unwrap_or(Money::ZERO),
                max_price: group.iter().map(|o| o.price).max().unwrap_or(Money::ZERO),
                stock: group.iter().map(|o| o.stock as u64).sum(),
                freshest_at: group.iter().map(|o| o.updated_at).max().unwrap_or(0),
                providers: breakdown(&group),
            }
        })
        .collect())
}
