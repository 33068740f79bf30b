use std::sync::Arc;

use bytes::Bytes;
use hichat_core::{history_key, Envelope, EnvelopeError, GroupId, MessageKind, UserId};
use hichat_store::{CommunityRepo, HistoryRepo, StoreError};
use tokio::sync::mpsc;

use crate::session::{PushOutcome, SessionRegistry};

/// Resolves the members of a group.
pub trait MembershipLookup: Send + Sync {
    fn members_of(&self, group: GroupId) -> Result<Vec<UserId>, StoreError>;
}

impl MembershipLookup for CommunityRepo {
    fn members_of(&self, group: GroupId) -> Result<Vec<UserId>, StoreError> {
        CommunityRepo::members_of(self, group)
    }
}

/// Why a relay message was abandoned before any delivery.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("membership lookup for group {group} failed: {source}")]
    Membership {
        group: GroupId,
        #[source]
        source: StoreError,
    },
    #[error("group {0} has no members")]
    NoMembers(GroupId),
}

impl DispatchError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Envelope(_) => "envelope",
            Self::Membership { .. } => "membership",
            Self::NoMembers(_) => "no_members",
        }
    }
}

/// Per-message delivery tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Recipients whose queue accepted the payload.
    pub delivered: usize,
    /// Recipients with no registered session or a closed one.
    pub unreachable: usize,
    /// Recipients whose queue was full.
    pub dropped: usize,
    /// Deliveries whose history append failed.
    pub history_failures: usize,
}

/// Routes relay messages to the sessions of their recipients and records
/// every handed-off delivery in the pairwise history.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    history: HistoryRepo,
    membership: Arc<dyn MembershipLookup>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        history: HistoryRepo,
        membership: Arc<dyn MembershipLookup>,
    ) -> Self {
        Self {
            registry,
            history,
            membership,
        }
    }

    /// Route one raw relay message.
    pub fn dispatch(&self, raw: &[u8]) -> Result<DispatchReport, DispatchError> {
        let text = std::str::from_utf8(raw).map_err(|_| EnvelopeError::NotUtf8)?;
        let envelope = Envelope::decode(raw)?;
        let mut report = DispatchReport::default();

        match envelope.kind {
            MessageKind::Direct => {
                self.deliver(envelope.from_id, envelope.target_user(), text, &mut report);
            }
            MessageKind::Group => {
                let group = GroupId::new(envelope.target_id);
                let members = self
                    .membership
                    .members_of(group)
                    .map_err(|source| DispatchError::Membership { group, source })?;
                if members.is_empty() {
                    return Err(DispatchError::NoMembers(group));
                }
                for member in members.into_iter().filter(|m| *m != envelope.from_id) {
                    self.deliver(envelope.from_id, member, text, &mut report);
                }
            }
        }
        Ok(report)
    }

    fn deliver(&self, from: UserId, to: UserId, payload: &str, report: &mut DispatchReport) {
        let Some(session) = self.registry.lookup(to) else {
            tracing::debug!(user_id = %from, target_id = %to, "Recipient not connected, dropping");
            report.unreachable += 1;
            return;
        };

        match session.push(payload.to_owned()) {
            PushOutcome::Queued => report.delivered += 1,
            PushOutcome::Full => {
                report.dropped += 1;
                return;
            }
            PushOutcome::Closed => {
                report.unreachable += 1;
                return;
            }
        }

        let key = history_key(from, to);
        if let Err(e) = self.history.append(&key, payload) {
            // The delivery already happened; history is best effort
            tracing::warn!(
                user_id = %from,
                target_id = %to,
                conversation = %key,
                error = %e,
                kind = e.error_kind(),
                "Failed to store message"
            );
            report.history_failures += 1;
        }
    }

    /// Consume the relay ingress until it closes.
    ///
    /// History appends and membership lookups are synchronous SQLite calls,
    /// so each one blocks this task's worker thread until it returns.
    pub async fn run(self: Arc<Self>, mut ingress: mpsc::Receiver<Bytes>) {
        while let Some(raw) = ingress.recv().await {
            match self.dispatch(&raw) {
                Ok(report) => {
                    tracing::trace!(
                        delivered = report.delivered,
                        unreachable = report.unreachable,
                        dropped = report.dropped,
                        "Dispatched message"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        kind = e.error_kind(),
                        len = raw.len(),
                        "Dropped relay message"
                    );
                }
            }
        }
        tracing::info!("Relay ingress closed, dispatcher stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hichat_store::{Database, RangeOrder};
    use std::collections::HashSet;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        history: HistoryRepo,
        communities: CommunityRepo,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(SessionRegistry::new(50));
        let history = HistoryRepo::new(db.clone());
        let communities = CommunityRepo::new(db);
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            history.clone(),
            Arc::new(communities.clone()),
        );
        Fixture {
            registry,
            history,
            communities,
            dispatcher,
        }
    }

    struct FailingLookup;

    impl MembershipLookup for FailingLookup {
        fn members_of(&self, _group: GroupId) -> Result<Vec<UserId>, StoreError> {
            Err(StoreError::Database("unavailable".into()))
        }
    }

    fn direct(from: u64, to: u64, content: &str) -> Vec<u8> {
        format!(r#"{{"userId":{from},"targetId":{to},"Type":1,"Media":1,"Content":"{content}"}}"#)
            .into_bytes()
    }

    fn group(from: u64, group: u64, content: &str) -> Vec<u8> {
        format!(r#"{{"userId":{from},"targetId":{group},"Type":2,"Media":1,"Content":"{content}"}}"#)
            .into_bytes()
    }

    #[tokio::test]
    async fn direct_message_reaches_recipient_and_history() {
        let f = fixture();
        let (_session, mut rx) = f.registry.connect(UserId::new(42), HashSet::new());
        let raw = direct(1, 42, "hello");

        let report = f.dispatcher.dispatch(&raw).unwrap();
        assert_eq!(report.delivered, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.as_bytes(), raw.as_slice());

        let key = history_key(UserId::new(1), UserId::new(42));
        let entries = f.history.range(&key, 0, -1, RangeOrder::Ascending).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].as_bytes(), raw.as_slice());
    }

    #[test]
    fn unreachable_recipient_gets_nothing() {
        let f = fixture();
        let report = f.dispatcher.dispatch(&direct(1, 99, "anyone?")).unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.unreachable, 1);
        assert_eq!(f.history.count("msg_1_99").unwrap(), 0);
    }

    #[tokio::test]
    async fn group_message_skips_sender() {
        let f = fixture();
        let g = f.communities.create(UserId::new(1), "trio", "").unwrap();
        f.communities.join(UserId::new(2), g.id).unwrap();
        f.communities.join(UserId::new(3), g.id).unwrap();

        let (_s1, mut rx1) = f.registry.connect(UserId::new(1), HashSet::new());
        let (_s2, mut rx2) = f.registry.connect(UserId::new(2), HashSet::new());
        let (_s3, mut rx3) = f.registry.connect(UserId::new(3), HashSet::new());

        let raw = group(1, g.id.get(), "hi all");
        let report = f.dispatcher.dispatch(&raw).unwrap();
        assert_eq!(report.delivered, 2);

        assert_eq!(rx2.recv().await.unwrap().as_bytes(), raw.as_slice());
        assert_eq!(rx3.recv().await.unwrap().as_bytes(), raw.as_slice());
        assert!(rx1.try_recv().is_err());

        // One pairwise entry per recipient, none for the sender with itself
        assert_eq!(f.history.count("msg_1_2").unwrap(), 1);
        assert_eq!(f.history.count("msg_1_3").unwrap(), 1);
        assert_eq!(f.history.count("msg_1_1").unwrap(), 0);
    }

    #[test]
    fn group_message_with_offline_member_delivers_to_the_rest() {
        let f = fixture();
        let g = f.communities.create(UserId::new(1), "pair", "").unwrap();
        f.communities.join(UserId::new(2), g.id).unwrap();
        f.communities.join(UserId::new(3), g.id).unwrap();
        let (_s2, _rx2) = f.registry.connect(UserId::new(2), HashSet::new());

        let report = f.dispatcher.dispatch(&group(1, g.id.get(), "x")).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.unreachable, 1);
        assert_eq!(f.history.count("msg_1_3").unwrap(), 0);
    }

    #[test]
    fn unknown_group_is_abandoned() {
        let f = fixture();
        let err = f.dispatcher.dispatch(&group(1, 404, "x")).unwrap_err();
        assert!(matches!(err, DispatchError::NoMembers(g) if g == GroupId::new(404)));
    }

    #[test]
    fn membership_failure_is_abandoned() {
        let registry = Arc::new(SessionRegistry::new(50));
        let history = HistoryRepo::new(Database::in_memory().unwrap());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), history, Arc::new(FailingLookup));
        let (_s, mut rx) = registry.connect(UserId::new(2), HashSet::new());

        let err = dispatcher.dispatch(&group(1, 5, "x")).unwrap_err();
        assert!(matches!(err, DispatchError::Membership { .. }));
        assert_eq!(err.error_kind(), "membership");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let f = fixture();
        assert!(matches!(
            f.dispatcher.dispatch(b"{not json"),
            Err(DispatchError::Envelope(_))
        ));
        assert!(matches!(
            f.dispatcher.dispatch(&[0xff, 0x00]),
            Err(DispatchError::Envelope(EnvelopeError::NotUtf8))
        ));
        assert!(matches!(
            f.dispatcher.dispatch(br#"{"userId":1,"targetId":2,"Type":7}"#),
            Err(DispatchError::Envelope(_))
        ));
    }

    #[test]
    fn full_queue_skips_history() {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(SessionRegistry::new(1));
        let history = HistoryRepo::new(db.clone());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            history.clone(),
            Arc::new(CommunityRepo::new(db)),
        );
        let (_s, _rx) = registry.connect(UserId::new(2), HashSet::new());

        assert_eq!(dispatcher.dispatch(&direct(1, 2, "a")).unwrap().delivered, 1);
        let report = dispatcher.dispatch(&direct(1, 2, "b")).unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(history.count("msg_1_2").unwrap(), 1);
    }

    #[tokio::test]
    async fn history_failure_keeps_delivery() {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(SessionRegistry::new(8));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            HistoryRepo::new(db.clone()),
            Arc::new(CommunityRepo::new(db.clone())),
        );
        let (_s, mut rx) = registry.connect(UserId::new(2), HashSet::new());
        db.with_conn(|conn| Ok(conn.execute_batch("DROP TABLE history")?))
            .unwrap();

        let raw = direct(1, 2, "unrecorded");
        let report = dispatcher.dispatch(&raw).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.history_failures, 1);
        assert_eq!(rx.recv().await.unwrap().as_bytes(), raw.as_slice());
    }

    #[tokio::test]
    async fn unknown_media_code_is_still_routed() {
        let f = fixture();
        let (_s, mut rx) = f.registry.connect(UserId::new(2), HashSet::new());
        let raw = br#"{"userId":1,"targetId":2,"Type":1,"Media":3,"Content":"sticker"}"#;

        let report = f.dispatcher.dispatch(raw).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(rx.recv().await.unwrap().as_bytes(), raw.as_slice());
        assert_eq!(f.history.count("msg_1_2").unwrap(), 1);
    }

    #[test]
    fn dispatch_errors_classify() {
        let f = fixture();
        let malformed = f.dispatcher.dispatch(b"{").unwrap_err();
        assert_eq!(malformed.error_kind(), "envelope");
        let empty = f.dispatcher.dispatch(&group(1, 8, "x")).unwrap_err();
        assert_eq!(empty.error_kind(), "no_members");
    }

    #[test]
    fn replies_share_one_conversation() {
        let f = fixture();
        let (_s1, _rx1) = f.registry.connect(UserId::new(1), HashSet::new());
        let (_s2, _rx2) = f.registry.connect(UserId::new(2), HashSet::new());

        f.dispatcher.dispatch(&direct(1, 2, "ping")).unwrap();
        f.dispatcher.dispatch(&direct(2, 1, "pong")).unwrap();

        let entries = f.history.range("msg_1_2", 0, -1, RangeOrder::Ascending).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].contains("ping"));
        assert!(entries[1].contains("pong"));
    }

    #[tokio::test]
    async fn run_drains_ingress_until_closed() {
        let f = fixture();
        let (_s, mut rx) = f.registry.connect(UserId::new(5), HashSet::new());
        let (tx, ingress) = mpsc::channel(4);
        let dispatcher = Arc::new(f.dispatcher);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(ingress));

        tx.send(Bytes::from(direct(4, 5, "via relay"))).await.unwrap();
        tx.send(Bytes::from_static(b"garbage")).await.unwrap();
        drop(tx);

        handle.await.unwrap();
        assert!(rx.recv().await.unwrap().contains("via relay"));
        assert_eq!(f.history.count("msg_4_5").unwrap(), 1);
    }
}
