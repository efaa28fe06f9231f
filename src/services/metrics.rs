use lazy_static::lazy_static;
use prometheus::{register_counter, register_counter_vec, Counter, CounterVec};

lazy_static! {
    pub static ref VOTES_COUNTER: CounterVec = register_counter_vec!(
        "daily_menu_votes_total",
        "Vote requests by outcome (cast, changed, unchanged, cancelled)",
        &["action"]
    ).unwrap();

    pub static ref ROUNDS_COUNTER: CounterVec = register_counter_vec!(
        "daily_menu_rounds_total",
        "Voting round transitions (started, closed, admin_set)",
        &["event"]
    ).unwrap();

    pub static ref CONFLICTS_COUNTER: Counter = register_counter!(
        "daily_menu_write_conflicts_total",
        "Versioned writes that lost against a concurrent writer"
    ).unwrap();
}
