//! Stateful property testing for live vote tallies.
//!
//! The reference model is the last vote of each voter. The system under
//! test is a memory store plus a vote aggregator that is attached, dropped
//! and reattached at arbitrary points, so votes land on both sides of the
//! history/live boundary.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use loom_store::{Content, LogStore, MemoryStore, NewMessage, Vote, VoteContent};
use loom_view::votes::tally_from_history;
use loom_view::{VoteAggregator, VoteTally};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

const TARGET: &str = "%repo.sha256";
const VOTERS: usize = 5;

fn voter(index: usize) -> String {
    format!("@voter{}.ed25519", index)
}

fn vote_message(voter: &str, value: Option<i64>) -> NewMessage {
    NewMessage {
        key: None,
        author: voter.to_string(),
        timestamp: 0,
        content: Content::Vote(VoteContent {
            vote: Some(Vote {
                link: Some(TARGET.to_string()),
                value,
            }),
        }),
    }
}

fn vote_value() -> impl Strategy<Value = Option<i64>> {
    prop_oneof![
        1 => Just(None),
        4 => (-2i64..=2).prop_map(Some),
    ]
}

/// Operations on the vote system.
#[derive(Debug, Clone)]
pub enum VoteOperation {
    /// A voter publishes a vote on the target.
    Cast { voter: usize, value: Option<i64> },
    /// Start (or keep) a live tally for the target.
    Attach,
    /// Drop the cached tally and its subscription.
    Forget,
}

/// Reference model: the latest vote value per voter.
#[derive(Clone, Debug, Default)]
pub struct VoteModel {
    pub latest: BTreeMap<String, Option<i64>>,
    pub attached: bool,
    pub votes_cast: u64,
}

impl VoteModel {
    fn upvoters(&self) -> Vec<String> {
        self.latest
            .iter()
            .filter(|(_, v)| v.is_some_and(|v| v > 0))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn downvoters(&self) -> Vec<String> {
        self.latest
            .iter()
            .filter(|(_, v)| v.is_some_and(|v| v < 0))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl ReferenceStateMachine for VoteModel {
    type State = Self;
    type Transition = VoteOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            6 => (0..VOTERS, vote_value()).prop_map(|(voter, value)| VoteOperation::Cast { voter, value }),
            2 => Just(VoteOperation::Attach),
            1 => Just(VoteOperation::Forget),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            VoteOperation::Cast { voter: index, value } => {
                state.latest.insert(voter(*index), *value);
                state.votes_cast += 1;
            }
            VoteOperation::Attach => state.attached = true,
            VoteOperation::Forget => state.attached = false,
        }
        state
    }
}

/// Wraps a memory store and a vote aggregator with a tokio runtime.
pub struct VoteTestHarness {
    runtime: Runtime,
    store: Arc<MemoryStore>,
    votes: VoteAggregator,
}

impl VoteTestHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let store = MemoryStore::new("@me");
        let log: Arc<dyn LogStore> = store.clone();
        let votes = VoteAggregator::new(log);
        Self {
            runtime,
            store,
            votes,
        }
    }

    fn apply_operation(&self, op: &VoteOperation) {
        self.runtime.block_on(async {
            match op {
                VoteOperation::Cast { voter: index, value } => {
                    self.store.append(vote_message(&voter(*index), *value));
                }
                VoteOperation::Attach => {
                    self.votes.get_votes(TARGET).await.unwrap();
                }
                VoteOperation::Forget => {
                    self.votes.forget(TARGET);
                }
            }
        });
    }

    /// The live tally once it has caught up with every appended vote.
    fn settled_tally(&self, votes_cast: u64) -> VoteTally {
        self.runtime.block_on(async {
            let mut rx = self.votes.watch(TARGET).await.unwrap();
            let tally = tokio::time::timeout(
                Duration::from_secs(5),
                rx.wait_for(|t| t.last_seq == votes_cast),
            )
            .await
            .expect("live tally never caught up")
            .unwrap()
            .clone();
            tally
        })
    }

    fn verify_invariants(&self, model: &VoteModel) {
        if !model.attached {
            assert_eq!(self.votes.cached(), 0);
            return;
        }

        let tally = self.settled_tally(model.votes_cast);

        // Counts equal map sizes and no voter is on both sides.
        assert_eq!(tally.upvotes, tally.upvoters.len());
        assert_eq!(tally.downvotes, tally.downvoters.len());
        for voter in tally.upvoters.keys() {
            assert!(!tally.downvoters.contains_key(voter));
        }

        // Live state matches the last vote of every voter.
        let upvoters: Vec<String> = tally.upvoters.keys().cloned().collect();
        let downvoters: Vec<String> = tally.downvoters.keys().cloned().collect();
        assert_eq!(upvoters, model.upvoters());
        assert_eq!(downvoters, model.downvoters());

        // And matches a fresh fold over history.
        let fresh = self
            .runtime
            .block_on(tally_from_history(&*self.store, TARGET))
            .unwrap();
        assert_eq!(tally, fresh);
    }
}

impl StateMachineTest for VoteTestHarness {
    type SystemUnderTest = Self;
    type Reference = VoteModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn vote_state_machine_test(sequential 1..50 => VoteTestHarness);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Where history ends and the live tail starts does not change the
    /// final tally.
    #[test]
    fn history_live_split_is_invisible(
        votes in prop::collection::vec((0..VOTERS, vote_value()), 1..20),
        split in any::<prop::sample::Index>(),
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let split = split.index(votes.len() + 1);
            let store = MemoryStore::new("@me");
            let aggregator = VoteAggregator::new(store.clone());

            for (index, value) in &votes[..split] {
                store.append(vote_message(&voter(*index), *value));
            }
            let mut rx = aggregator.watch(TARGET).await.unwrap();
            for (index, value) in &votes[split..] {
                store.append(vote_message(&voter(*index), *value));
            }

            let expected_seq = votes.len() as u64;
            let live = tokio::time::timeout(
                Duration::from_secs(5),
                rx.wait_for(|t| t.last_seq == expected_seq),
            )
            .await
            .unwrap()
            .unwrap()
            .clone();

            let mut folded = VoteTally::default();
            for (index, value) in &votes {
                folded.apply_vote(&voter(*index), *value);
            }

            prop_assert_eq!(&live.upvoters, &folded.upvoters);
            prop_assert_eq!(&live.downvoters, &folded.downvoters);
            prop_assert_eq!(live.upvotes, folded.upvotes);
            prop_assert_eq!(live.downvotes, folded.downvotes);
            Ok(())
        })?;
    }

    #[test]
    fn counts_match_voter_sets(
        votes in prop::collection::vec((0..VOTERS, vote_value()), 0..40),
    ) {
        let mut tally = VoteTally::default();
        for (index, value) in &votes {
            tally.apply_vote(&voter(*index), *value);
            prop_assert_eq!(tally.upvotes, tally.upvoters.len());
            prop_assert_eq!(tally.downvotes, tally.downvoters.len());
            prop_assert!(tally.upvoters.keys().all(|v| !tally.downvoters.contains_key(v)));
        }
    }
}

#[test]
fn test_seven_three_and_three_seven_splits_agree() {
    let rt = Runtime::new().unwrap();
    let votes: Vec<(usize, Option<i64>)> = vec![
        (0, Some(1)),
        (1, Some(1)),
        (2, Some(-1)),
        (0, Some(0)),
        (3, Some(1)),
        (1, None),
        (4, Some(-1)),
        (2, Some(1)),
        (0, Some(1)),
        (3, Some(-1)),
    ];

    let run = |split: usize| {
        let votes = votes.clone();
        rt.block_on(async move {
            let store = MemoryStore::new("@me");
            let aggregator = VoteAggregator::new(store.clone());
            for (index, value) in &votes[..split] {
                store.append(vote_message(&voter(*index), *value));
            }
            let mut rx = aggregator.watch(TARGET).await.unwrap();
            for (index, value) in &votes[split..] {
                store.append(vote_message(&voter(*index), *value));
            }
            let tally = rx
                .wait_for(|t| t.last_seq == votes.len() as u64)
                .await
                .unwrap()
                .clone();
            (tally.upvoters, tally.downvoters)
        })
    };

    let (up, down) = run(7);
    assert_eq!((up.clone(), down.clone()), run(3));
    assert_eq!(up.keys().collect::<Vec<_>>(), vec!["@voter0.ed25519", "@voter2.ed25519"]);
    assert_eq!(down.keys().collect::<Vec<_>>(), vec!["@voter3.ed25519", "@voter4.ed25519"]);
}
