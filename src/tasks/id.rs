//! Id generation for tasks and automation rules.
//!
//! Ids are a slug of the title followed by 8 random hex characters, e.g.
//! `weekly-report-3fa9c012`. Rule ids carry a `rule-` prefix.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Global counter for deterministic ID generation in tests.
static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Whether to use deterministic IDs (for testing).
static USE_DETERMINISTIC_IDS: AtomicBool = AtomicBool::new(false);

/// Maximum slug length before the suffix.
const MAX_SLUG_LEN: usize = 40;

/// Enable deterministic ID generation for testing.
///
/// When enabled, IDs use a counter instead of random hex.
pub fn enable_deterministic_ids() {
    USE_DETERMINISTIC_IDS.store(true, Ordering::SeqCst);
    TEST_COUNTER.store(0, Ordering::SeqCst);
}

/// Disable deterministic ID generation.
pub fn disable_deterministic_ids() {
    USE_DETERMINISTIC_IDS.store(false, Ordering::SeqCst);
}

/// Convert a title to a lowercase, hyphen-separated ASCII slug.
#[must_use]
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_hyphen = true; // Start true to avoid leading hyphen

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
    }
    while slug.ends_with('-') {
        slug.pop();
    }

    slug
}

/// Generate an 8-character hex suffix.
#[allow(clippy::cast_possible_truncation)]
fn random_suffix() -> String {
    if USE_DETERMINISTIC_IDS.load(Ordering::SeqCst) {
        let count = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("{count:08x}")
    } else {
        use std::collections::hash_map::RandomState;
        use std::hash::{BuildHasher, Hasher};

        let mut hasher = RandomState::new().build_hasher();
        // Truncation is intentional - we only need entropy, not precision
        hasher.write_u64(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos() as u64),
        );
        format!("{:08x}", hasher.finish() & 0xFFFF_FFFF)
    }
}

fn with_suffix(slug: &str, fallback: &str) -> String {
    let suffix = random_suffix();
    if slug.is_empty() {
        format!("{fallback}-{suffix}")
    } else {
        format!("{slug}-{suffix}")
    }
}

/// Generate a task ID from a title.
#[must_use]
pub fn generate_task_id(title: &str) -> String {
    with_suffix(&slugify(title), "task")
}

/// Generate an automation rule ID from a rule name.
#[must_use]
pub fn generate_rule_id(name: &str) -> String {
    let slug = slugify(name);
    if slug.is_empty() {
        with_suffix("", "rule")
    } else {
        with_suffix(&format!("rule-{slug}"), "rule")
    }
}
