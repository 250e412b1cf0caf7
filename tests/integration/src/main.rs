//! Integration test harness.
//!
//! Runs every test category and reports a summary. The categories also run
//! individually:
//!
//! ```text
//! cargo test -p integration-tests --test sync_tests
//! cargo test -p integration-tests --test cache_tests
//! cargo test -p integration-tests --test failure_tests
//! cargo test -p integration-tests --test push_tests
//! cargo test -p integration-tests --test session_tests
//! ```
//!
//! Increase logging with `DISTOBJ_LOG_LEVEL=debug`.

use std::process::Command;
use std::time::Instant;

struct TestCategory {
    name: &'static str,
    description: &'static str,
    test_name: &'static str,
}

const TEST_CATEGORIES: &[TestCategory] = &[
    TestCategory {
        name: "Sync",
        description: "register/map/commit/sync across change types",
        test_name: "sync_tests",
    },
    TestCategory {
        name: "Cache",
        description: "send-on-register warming and multicast dedup",
        test_name: "cache_tests",
    },
    TestCategory {
        name: "Failure",
        description: "master loss, discovery, unmap, reconnect",
        test_name: "failure_tests",
    },
    TestCategory {
        name: "Push",
        description: "one-shot push and user-defined commands",
        test_name: "push_tests",
    },
    TestCategory {
        name: "Session",
        description: "identifier allocation, local and proxied",
        test_name: "session_tests",
    },
];

fn main() {
    let mut failures = Vec::new();
    let start = Instant::now();

    for category in TEST_CATEGORIES {
        println!("==> {}: {}", category.name, category.description);
        let status = Command::new("cargo")
            .args(["test", "-p", "integration-tests", "--test", category.test_name])
            .status()
            .expect("failed to spawn cargo");
        if !status.success() {
            failures.push(category.name);
        }
    }

    println!();
    println!(
        "{} categories in {:.1}s, {} failed",
        TEST_CATEGORIES.len(),
        start.elapsed().as_secs_f64(),
        failures.len()
    );
    if !failures.is_empty() {
        for name in &failures {
            println!("  FAILED: {name}");
        }
        std::process::exit(1);
    }
}
