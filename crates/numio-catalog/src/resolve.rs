//! Purchase-time offer resolution.
//!
//! Inputs are whatever the caller has — a canonical name, a provider-native
//! code, or free text. Resolution goes through names, not codes: provider
//! codes are ambiguous across upstreams ("wa" is WhatsApp on one vendor and
//! a carrier on another). Strategies are tried in order; the first one that
//! yields candidates wins, then the cheapest in-stock offer is picked.
//!
//! The resolver is pure against the offer index; it never mutates state.

use tracing::debug;

use numio_core::{NumioError, Offer, ProviderId};

use crate::index::{OfferQuery, SearchIndex, SortBy};

/// Alias → canonical service name. Covers the high-traffic services; anything
/// else falls through to code/name/free-text strategies.
const SERVICE_ALIASES: &[(&str, &str)] = &[
    ("telegram", "Telegram"),
    ("tg", "Telegram"),
    ("whatsapp", "WhatsApp"),
    ("wa", "WhatsApp"),
    ("google", "Google"),
    ("gmail", "Google"),
    ("instagram", "Instagram"),
    ("ig", "Instagram"),
    ("facebook", "Facebook"),
    ("fb", "Facebook"),
    ("viber", "Viber"),
    ("discord", "Discord"),
    ("ds", "Discord"),
    ("openai", "OpenAI"),
    ("uber", "Uber"),
];

/// Alias → canonical country name. Numeric vendor codes deliberately absent:
/// exact normalized names take precedence over codes.
const COUNTRY_ALIASES: &[(&str, &str)] = &[
    ("us", "United States"),
    ("usa", "United States"),
    ("united states", "United States"),
    ("uk", "United Kingdom"),
    ("gb", "United Kingdom"),
    ("united kingdom", "United Kingdom"),
    ("de", "Germany"),
    ("germany", "Germany"),
    ("fr", "France"),
    ("france", "France"),
    ("in", "India"),
    ("india", "India"),
    ("id", "Indonesia"),
    ("indonesia", "Indonesia"),
    ("ru", "Russia"),
    ("russia", "Russia"),
];

fn normalize(input: &str) -> String {
    input.trim().to_lowercase()
}

fn canonical_service(input: &str) -> Option<&'static str> {
    let norm = normalize(input);
    SERVICE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == norm)
        .map(|(_, name)| *name)
}

fn canonical_country(input: &str) -> Option<&'static str> {
    let norm = normalize(input);
    COUNTRY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == norm)
        .map(|(_, name)| *name)
}

/// Resolve `(service, country[, operator][, provider])` to the cheapest
/// in-stock offer.
pub async fn resolve_offer(
    index: &dyn SearchIndex,
    service_input: &str,
    country_input: &str,
    operator: Option<&str>,
    provider: Option<&ProviderId>,
) -> Result<Offer, NumioError> {
    if service_input.trim().is_empty() || country_input.trim().is_empty() {
        return Err(NumioError::InvalidRequest(
            "service and country are required".into(),
        ));
    }

    let country = CountryConstraint::from_input(country_input);

    // Strategy 1: direct canonical-name map.
    if let Some(name) = canonical_service(service_input) {
        if let Some(offer) =
            cheapest(index, service_query(&country, operator, provider, |q| {
                q.service_name = Some(name.to_string());
            }))
            .await?
        {
            return Ok(offer);
        }
    }

    // Strategy 2: provider-native service code.
    if let Some(offer) = cheapest(index, service_query(&country, operator, provider, |q| {
        q.service_code = Some(normalize(service_input));
    }))
    .await?
    {
        return Ok(offer);
    }

    // Strategy 3: the input already is a canonical service name.
    if let Some(offer) = cheapest(index, service_query(&country, operator, provider, |q| {
        q.service_name = Some(service_input.trim().to_string());
    }))
    .await?
    {
        return Ok(offer);
    }

    // Strategy 4: free-text search.
    if let Some(offer) = cheapest(index, service_query(&country, operator, provider, |q| {
        q.text = Some(service_input.trim().to_string());
    }))
    .await?
    {
        debug!(service = service_input, "offer resolved via free-text fallback");
        return Ok(offer);
    }

    Err(NumioError::NoMatchingOffer)
}

/// Country narrowing, name-first.
enum CountryConstraint {
    Name(String),
    Code(String),
}

impl CountryConstraint {
    fn from_input(input: &str) -> Self {
        if let Some(name) = canonical_country(input) {
            return CountryConstraint::Name(name.to_string());
        }
        let trimmed = input.trim();
        // Bare numbers are vendor country codes; everything else is a name.
        if trimmed.chars().all(|c| c.is_ascii_digit()) {
            CountryConstraint::Code(trimmed.to_string())
        } else {
            CountryConstraint::Name(trimmed.to_string())
        }
    }

    fn apply(&self, q: &mut OfferQuery) {
        match self {
            CountryConstraint::Name(name) => q.country_name = Some(name.clone()),
            CountryConstraint::Code(code) => q.country_code = Some(code.clone()),
        }
    }
}

fn service_query(
    country: &CountryConstraint,
    operator: Option<&str>,
    provider: Option<&ProviderId>,
    shape: impl FnOnce(&mut OfferQuery),
) -> OfferQuery {
    let mut q = OfferQuery {
        operator: operator.map(str::to_string),
        provider: provider.cloned(),
        in_stock_only: true,
        sort: SortBy::PriceAsc,
        limit: 1,
        ..Default::default()
    };
    country.apply(&mut q);
    shape(&mut q);
    q
}

async fn cheapest(
    index: &dyn SearchIndex,
    query: OfferQuery,
) -> Result<Option<Offer>, NumioError> {
    Ok(index.search(query).await?.into_iter().next())
}
