//! Deduplication, ranking and pagination of merged listings.
//!
//! Duplicate detection, in order:
//! 1. the same `(source, source_id)` seen twice is dropped outright;
//! 2. equal normalized VINs are the same vehicle;
//! 3. otherwise, when at least one side lacks a VIN, listings with the same
//!    normalized title, year, make and model whose prices are within the
//!    tolerance are the same vehicle.
//!
//! Two listings with different VINs are never merged. Among duplicates the
//! listing from the source with the lowest documented staleness wins; when
//! neither or both are equal, the first one seen wins. Batches are fed in
//! source id order, so "first seen" does not depend on arrival order.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::config::SchedulerConfig;
use crate::models::{Listing, SearchRequest, SortOrder, normalize_text};

/// Listings returned by one source, with that source's staleness.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source: String,
    pub staleness_secs: Option<u64>,
    pub listings: Vec<Listing>,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceTolerance {
    pub absolute: u32,
    pub percent: f64,
}

impl PriceTolerance {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            absolute: config.dedup_price_tolerance,
            percent: config.dedup_price_tolerance_pct,
        }
    }

    fn matches(&self, a: Option<u32>, b: Option<u32>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => {
                let diff = a.abs_diff(b);
                let relative = f64::from(a.max(b)) * self.percent / 100.0;
                f64::from(diff) <= f64::from(self.absolute).max(relative)
            }
            (None, None) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FuzzyKey {
    title: String,
    year: Option<u16>,
    make: Option<String>,
    model: Option<String>,
}

impl FuzzyKey {
    fn of(listing: &Listing) -> Self {
        Self {
            title: normalize_text(&listing.title),
            year: listing.year,
            make: listing.make.as_deref().map(normalize_text),
            model: listing.model.as_deref().map(normalize_text),
        }
    }
}

struct Kept {
    listing: Listing,
    vin: Option<String>,
    staleness: Option<u64>,
}

/// Merge batches into one duplicate-free list, in first-seen order.
pub fn dedup(batches: Vec<SourceBatch>, tolerance: PriceTolerance) -> Vec<Listing> {
    let mut kept: Vec<Kept> = Vec::new();
    let mut seen_ids: HashSet<(String, String)> = HashSet::new();
    let mut by_vin: HashMap<String, usize> = HashMap::new();
    let mut by_key: HashMap<FuzzyKey, Vec<usize>> = HashMap::new();

    for batch in batches {
        for listing in batch.listings {
            if !seen_ids.insert((listing.source.clone(), listing.source_id.clone())) {
                continue;
            }

            let vin = listing.normalized_vin();
            let key = FuzzyKey::of(&listing);

            let existing = vin.as_ref().and_then(|v| by_vin.get(v).copied()).or_else(|| {
                by_key.get(&key).and_then(|candidates| {
                    candidates.iter().copied().find(|&idx| {
                        let other = &kept[idx];
                        let vins_compatible = vin.is_none() || other.vin.is_none();
                        vins_compatible && tolerance.matches(listing.price, other.listing.price)
                    })
                })
            });

            match existing {
                Some(idx) => {
                    let incumbent = &mut kept[idx];
                    let fresher = match (batch.staleness_secs, incumbent.staleness) {
                        (Some(new), Some(old)) => new < old,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    // The merged vehicle now has this VIN even if the incumbent listing stays.
                    if let Some(v) = &vin {
                        by_vin.entry(v.clone()).or_insert(idx);
                        incumbent.vin.get_or_insert_with(|| v.clone());
                    }
                    let candidates = by_key.entry(key).or_default();
                    if !candidates.contains(&idx) {
                        candidates.push(idx);
                    }
                    if fresher {
                        tracing::trace!(
                            winner = %listing.source,
                            loser = %incumbent.listing.source,
                            "Duplicate replaced by fresher source"
                        );
                        incumbent.staleness = batch.staleness_secs;
                        incumbent.listing = listing;
                    }
                }
                None => {
                    let idx = kept.len();
                    if let Some(v) = &vin {
                        by_vin.insert(v.clone(), idx);
                    }
                    by_key.entry(key).or_default().push(idx);
                    kept.push(Kept {
                        listing,
                        vin,
                        staleness: batch.staleness_secs,
                    });
                }
            }
        }
    }

    kept.into_iter().map(|k| k.listing).collect()
}

/// Order listings for presentation. Ties fall back to price, source, id.
pub fn rank(listings: &mut [Listing], request: &SearchRequest) {
    let sort = request.effective_sort();
    let tokens: Vec<String> = request
        .query
        .as_deref()
        .map(|q| normalize_text(q).split(' ').map(str::to_string).collect())
        .unwrap_or_default();

    let tie_break = |a: &Listing, b: &Listing| {
        asc_none_last(a.price, b.price)
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.source_id.cmp(&b.source_id))
    };

    match sort {
        SortOrder::Relevance => {
            let mut scored: Vec<(usize, Listing)> = listings
                .iter()
                .map(|l| (relevance(l, &tokens), l.clone()))
                .collect();
            scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| tie_break(a, b)));
            for (slot, (_, listing)) in listings.iter_mut().zip(scored) {
                *slot = listing;
            }
        }
        SortOrder::PriceAsc => listings.sort_by(tie_break),
        SortOrder::PriceDesc => listings.sort_by(|a, b| {
            desc_none_last(a.price, b.price).then_with(|| tie_break(a, b))
        }),
        SortOrder::YearDesc => listings.sort_by(|a, b| {
            desc_none_last(a.year, b.year).then_with(|| tie_break(a, b))
        }),
        SortOrder::MileageAsc => listings.sort_by(|a, b| {
            asc_none_last(a.mileage, b.mileage).then_with(|| tie_break(a, b))
        }),
    }
}

/// The `page`-th window (1-based) of `page_size` listings.
pub fn paginate(listings: &[Listing], page: u32, page_size: u32) -> Vec<Listing> {
    let start = (page.saturating_sub(1) as usize).saturating_mul(page_size as usize);
    listings
        .iter()
        .skip(start)
        .take(page_size as usize)
        .cloned()
        .collect()
}

fn relevance(listing: &Listing, tokens: &[String]) -> usize {
    if tokens.is_empty() {
        return 0;
    }
    let haystack = normalize_text(&format!(
        "{} {} {} {}",
        listing.title,
        listing.make.as_deref().unwrap_or_default(),
        listing.model.as_deref().unwrap_or_default(),
        listing.body_style.as_deref().unwrap_or_default(),
    ));
    let words: HashSet<&str> = haystack.split(' ').collect();
    tokens.iter().filter(|t| words.contains(t.as_str())).count()
}

fn asc_none_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn desc_none_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
