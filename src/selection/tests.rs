//! Unit tests for offer selection.

use rstest::{fixture, rstest};

use super::{SelectionError, SelectionPolicy, select_offers};
use crate::config::split_list;
use crate::provider::Offer;
use crate::test_support::offer;

#[fixture]
fn ten_offers() -> Vec<Offer> {
    vec![
        offer(10, "RTX 3060", 0.55),
        offer(1, "RTX 3060", 0.10),
        offer(6, "RTX A4000", 0.35),
        offer(2, "RTX 2080", 0.15),
        offer(8, "RTX 4090", 0.45),
        offer(3, "RTX 3070", 0.20),
        offer(9, "RTX A5000", 0.50),
        offer(4, "GTX 1080", 0.25),
        offer(7, "RTX 3080", 0.40),
        offer(5, "RTX 2070", 0.30),
    ]
}

fn policy(max_price: f64, excluded: &str, count: usize) -> SelectionPolicy {
    SelectionPolicy {
        max_price,
        excluded_models: split_list(excluded),
        count,
    }
}

#[rstest]
fn selects_cheapest_affordable_non_excluded_offers(ten_offers: Vec<Offer>) {
    let selection = select_offers(&ten_offers, &policy(0.50, "4090", 8))
        .unwrap_or_else(|err| panic!("selection should succeed: {err}"));

    let ids: Vec<u64> = selection.candidates.iter().map(|offer| offer.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 9]);
    assert_eq!(selection.eligible, 8);
    assert!(
        selection
            .candidates
            .iter()
            .all(|offer| offer.price_per_hour <= 0.50 && !offer.gpu_name.contains("4090"))
    );
}

#[rstest]
fn truncates_to_requested_count(ten_offers: Vec<Offer>) {
    let selection = select_offers(&ten_offers, &policy(0.50, "3090,4090", 3))
        .unwrap_or_else(|err| panic!("selection should succeed: {err}"));

    let ids: Vec<u64> = selection.candidates.iter().map(|offer| offer.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(selection.eligible, 8);
}

#[rstest]
fn reports_no_offers_when_everything_is_filtered(ten_offers: Vec<Offer>) {
    let err = select_offers(&ten_offers, &policy(0.05, "", 1))
        .expect_err("nothing is that cheap");

    assert_eq!(
        err,
        SelectionError::NoOffersAvailable {
            max_price: String::from("0.05"),
        }
    );
}

#[rstest]
fn reports_insufficient_offers_instead_of_truncating(ten_offers: Vec<Offer>) {
    let err = select_offers(&ten_offers, &policy(0.50, "4090", 9))
        .expect_err("only eight offers qualify");

    assert_eq!(
        err,
        SelectionError::InsufficientOffers {
            requested: 9,
            available: 8,
        }
    );
}

#[test]
fn equal_prices_keep_snapshot_order_across_runs() {
    let offers = vec![
        offer(30, "RTX 3060", 0.20),
        offer(10, "RTX 3060", 0.10),
        offer(20, "RTX 3060", 0.20),
        offer(40, "RTX 3060", 0.20),
    ];
    let rules = policy(1.0, "", 4);

    let first = select_offers(&offers, &rules)
        .unwrap_or_else(|err| panic!("selection should succeed: {err}"));
    let second = select_offers(&offers, &rules)
        .unwrap_or_else(|err| panic!("selection should succeed: {err}"));

    let ids: Vec<u64> = first.candidates.iter().map(|offer| offer.id).collect();
    assert_eq!(ids, vec![10, 30, 20, 40]);
    assert_eq!(first, second);
}

#[rstest]
#[case::ceiling(0.30)]
#[case::low(0.12)]
#[case::high(0.60)]
fn survivors_never_exceed_ceiling(ten_offers: Vec<Offer>, #[case] ceiling: f64) {
    let rules = policy(ceiling, "4090", 1);
    if let Ok(selection) = select_offers(&ten_offers, &rules) {
        let all_eligible: Vec<&Offer> = ten_offers.iter().filter(|o| rules.admits(o)).collect();
        assert_eq!(selection.eligible, all_eligible.len());
        assert!(all_eligible.iter().all(|o| o.price_per_hour <= ceiling));
        assert!(all_eligible.iter().all(|o| !o.gpu_name.contains("4090")));
    }
}
