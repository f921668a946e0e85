//! Room registry: the process-wide map from room id to live room.
//!
//! The registry is the only creator of rooms. Creation is "create if absent"
//! through a per-room `OnceCell`: concurrent callers for the same room wait on
//! the same initialization, while callers for other rooms never block on it.
//! The map lock is held only to fetch or remove a cell, never across an
//! engine call.

use crate::errors::RoomError;
use crate::media::{self, MediaEngine, RtpCodecCapability};
use crate::observability::metrics;

use super::messages::{JoinAck, JoinRequest};
use super::room::{RoomActor, RoomHandle};

use common::types::{MeetingId, RoomId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Attempts to route a join before giving up on a room that keeps closing.
const MAX_JOIN_ATTEMPTS: usize = 3;

type RoomCell = Arc<OnceCell<RoomHandle>>;

pub struct RoomRegistry {
    engine: Arc<dyn MediaEngine>,
    codecs: Vec<RtpCodecCapability>,
    engine_timeout: Duration,
    rooms: Mutex<HashMap<RoomId, RoomCell>>,
    tasks: Mutex<Vec<(RoomId, JoinHandle<()>)>>,
    accepting: AtomicBool,
    cancel_token: CancellationToken,
}

impl RoomRegistry {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        codecs: Vec<RtpCodecCapability>,
        engine_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            engine,
            codecs,
            engine_timeout,
            rooms: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            cancel_token,
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomId, RoomCell>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<(RoomId, JoinHandle<()>)>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the media engine can currently create rooms.
    #[must_use]
    pub fn engine_available(&self) -> bool {
        self.engine.is_available()
    }

    /// Stop creating rooms. Existing rooms keep running.
    pub fn set_draining(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!(target: "rs.registry", rooms = self.room_count(), "Registry draining");
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms()
            .values()
            .filter(|cell| cell.get().is_some_and(|handle| !handle.is_closed()))
            .count()
    }

    /// Handle of a live room, if any.
    #[must_use]
    pub fn handle(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.rooms()
            .get(room_id)
            .and_then(|cell| cell.get().cloned())
            .filter(|handle| !handle.is_closed())
    }

    /// Return the live room for `room_id`, creating it if absent.
    ///
    /// # Errors
    ///
    /// - `RoomError::Draining` while shutting down
    /// - `RoomError::RoutingEngineUnavailable` if the router cannot be created
    #[instrument(skip_all, fields(room_id = %room_id, meeting_id = %meeting_id))]
    pub async fn get_or_create(
        &self,
        room_id: &RoomId,
        meeting_id: MeetingId,
    ) -> Result<RoomHandle, RoomError> {
        loop {
            let cell = {
                let mut rooms = self.rooms();
                Arc::clone(
                    rooms
                        .entry(room_id.clone())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            };

            let created = cell
                .get_or_try_init(|| self.create_room(room_id, meeting_id))
                .await;

            match created {
                Ok(handle) if !handle.is_closed() => return Ok(handle.clone()),
                Ok(_) => {
                    // Closed between lookup and use; replace it.
                    self.evict_cell(room_id, &cell);
                }
                Err(e) => {
                    self.evict_cell(room_id, &cell);
                    return Err(e);
                }
            }
        }
    }

    async fn create_room(
        &self,
        room_id: &RoomId,
        meeting_id: MeetingId,
    ) -> Result<RoomHandle, RoomError> {
        if !self.is_accepting() {
            return Err(RoomError::Draining);
        }
        if !self.engine.is_available() {
            warn!(target: "rs.registry", room_id = %room_id, "Media engine unavailable");
            return Err(RoomError::RoutingEngineUnavailable(
                "media engine is not accepting routers".to_string(),
            ));
        }

        let router = media::bounded(
            self.engine_timeout,
            "create_router",
            self.engine.create_router(&self.codecs),
        )
        .await
        .map_err(|e| {
            error!(
                target: "rs.registry",
                room_id = %room_id,
                error = %e,
                "Router creation failed"
            );
            RoomError::RoutingEngineUnavailable(e.to_string())
        })?;

        let (handle, task) = RoomActor::spawn(
            room_id.clone(),
            meeting_id,
            router,
            self.engine_timeout,
            self.cancel_token.child_token(),
        );
        self.tasks().push((room_id.clone(), task));

        info!(
            target: "rs.registry",
            room_id = %room_id,
            meeting_id = %meeting_id,
            router_id = %handle.router_id(),
            "Room created"
        );
        Ok(handle)
    }

    /// Join a peer to the room, creating the room if needed. A room that
    /// closes while the join is in flight is replaced and the join retried.
    ///
    /// # Errors
    ///
    /// Propagates [`RoomRegistry::get_or_create`] failures.
    pub async fn join(
        &self,
        room_id: &RoomId,
        meeting_id: MeetingId,
        request: JoinRequest,
    ) -> Result<(RoomHandle, JoinAck), RoomError> {
        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            let handle = self.get_or_create(room_id, meeting_id).await?;
            match handle.join(request.clone()).await {
                Ok(ack) => {
                    self.update_gauge();
                    return Ok((handle, ack));
                }
                Err(e) if handle.is_closed() => {
                    debug!(
                        target: "rs.registry",
                        room_id = %room_id,
                        attempt,
                        error = %e,
                        "Room closed during join, retrying"
                    );
                    self.evict_handle(room_id, &handle);
                }
                Err(e) => return Err(e),
            }
        }
        Err(RoomError::Internal(format!(
            "room {room_id} closed repeatedly during join"
        )))
    }

    /// Close and remove the room if it has no peers. Returns whether it was
    /// removed.
    pub async fn remove_if_empty(&self, handle: &RoomHandle) -> bool {
        let closed = match handle.close_if_empty().await {
            Ok(closed) => closed,
            // Actor already gone.
            Err(_) => handle.is_closed(),
        };
        if closed {
            self.evict_handle(handle.room_id(), handle);
            info!(
                target: "rs.registry",
                room_id = %handle.room_id(),
                "Empty room removed"
            );
        }
        closed
    }

    /// Remove the room and tear it down, notifying its peers.
    #[instrument(skip_all, fields(room_id = %room_id))]
    pub async fn teardown(&self, room_id: &RoomId, reason: &str) {
        let cell = self.rooms().remove(room_id);
        self.update_gauge();

        let Some(handle) = cell.and_then(|cell| cell.get().cloned()) else {
            debug!(target: "rs.registry", room_id = %room_id, "No live room to tear down");
            return;
        };
        if let Err(e) = handle.teardown(reason).await {
            debug!(
                target: "rs.registry",
                room_id = %room_id,
                error = %e,
                "Room already stopped before teardown"
            );
        }
    }

    /// Stop all rooms and wait up to `grace` for their actors to exit.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.cancel_token.cancel();

        let tasks: Vec<_> = self.tasks().drain(..).collect();
        info!(target: "rs.registry", rooms = tasks.len(), "Shutting down rooms");

        for (room_id, task) in tasks {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => {
                    debug!(target: "rs.registry", room_id = %room_id, "Room actor completed cleanly");
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rs.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(target: "rs.registry", room_id = %room_id, "Room actor shutdown timed out");
                }
            }
        }

        self.rooms().clear();
        self.update_gauge();
    }

    /// Drop bookkeeping for room actors that have exited, and remove map
    /// entries whose room stopped without being removed.
    pub fn reap_finished(&self) -> usize {
        let finished: Vec<(RoomId, JoinHandle<()>)> = {
            let mut tasks = self.tasks();
            let (done, running): (Vec<_>, Vec<_>) =
                tasks.drain(..).partition(|(_, task)| task.is_finished());
            *tasks = running;
            done
        };

        for (room_id, _) in &finished {
            if let Some(handle) = self.handle_any(room_id) {
                if handle.is_closed() {
                    self.evict_handle(room_id, &handle);
                }
            }
        }
        finished.len()
    }

    fn handle_any(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.rooms()
            .get(room_id)
            .and_then(|cell| cell.get().cloned())
    }

    fn evict_cell(&self, room_id: &RoomId, cell: &RoomCell) {
        {
            let mut rooms = self.rooms();
            if rooms
                .get(room_id)
                .is_some_and(|current| Arc::ptr_eq(current, cell))
            {
                rooms.remove(room_id);
            }
        }
        self.update_gauge();
    }

    fn evict_handle(&self, room_id: &RoomId, handle: &RoomHandle) {
        {
            let mut rooms = self.rooms();
            let same_room = rooms
                .get(room_id)
                .and_then(|cell| cell.get())
                .is_some_and(|current| current.router_id() == handle.router_id());
            if same_room {
                rooms.remove(room_id);
            }
        }
        self.update_gauge();
    }

    fn update_gauge(&self) {
        metrics::set_rooms_active(self.room_count());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::PeerSummary;
    use crate::media::{default_media_codecs, LoopbackEngine};
    use crate::meetings::model::ParticipantRole;
    use chrono::Utc;
    use common::types::{PeerId, UserId};
    use tokio::sync::mpsc;

    fn registry(engine: Arc<LoopbackEngine>) -> RoomRegistry {
        RoomRegistry::new(
            engine,
            default_media_codecs(),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    fn request(user: &str) -> (JoinRequest, mpsc::Receiver<crate::actors::messages::PeerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            JoinRequest {
                info: PeerSummary {
                    peer_id: PeerId::new(),
                    user_id: UserId::from(user),
                    display_name: user.to_string(),
                    role: ParticipantRole::Participant,
                    hand_raised: false,
                    joined_at: Utc::now(),
                },
                events: tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = registry(Arc::new(LoopbackEngine::new()));
        let room_id = RoomId::from("r-1");
        let meeting_id = MeetingId::new();

        let a = registry.get_or_create(&room_id, meeting_id).await.unwrap();
        let b = registry.get_or_create(&room_id, meeting_id).await.unwrap();
        assert_eq!(a.router_id(), b.router_id());
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_room() {
        let registry = Arc::new(registry(Arc::new(LoopbackEngine::new())));
        let room_id = RoomId::from("r-1");
        let meeting_id = MeetingId::new();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let room_id = room_id.clone();
            tasks.push(tokio::spawn(async move {
                registry.get_or_create(&room_id, meeting_id).await.unwrap().router_id()
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_engine_rejects_new_rooms() {
        let engine = Arc::new(LoopbackEngine::new());
        let registry = registry(Arc::clone(&engine));
        engine.set_available(false);

        let result = registry
            .get_or_create(&RoomId::from("r-1"), MeetingId::new())
            .await;
        assert!(matches!(result, Err(RoomError::RoutingEngineUnavailable(_))));
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_draining_rejects_new_rooms_but_keeps_existing() {
        let registry = registry(Arc::new(LoopbackEngine::new()));
        let existing = RoomId::from("r-1");
        let meeting_id = MeetingId::new();
        registry.get_or_create(&existing, meeting_id).await.unwrap();

        registry.set_draining();
        assert!(registry.get_or_create(&existing, meeting_id).await.is_ok());
        let result = registry
            .get_or_create(&RoomId::from("r-2"), MeetingId::new())
            .await;
        assert!(matches!(result, Err(RoomError::Draining)));
    }

    #[tokio::test]
    async fn test_remove_if_empty_then_recreate() {
        let registry = registry(Arc::new(LoopbackEngine::new()));
        let room_id = RoomId::from("r-1");
        let meeting_id = MeetingId::new();

        let (req, _events) = request("alice");
        let peer_id = req.info.peer_id;
        let (handle, _ack) = registry.join(&room_id, meeting_id, req).await.unwrap();

        assert!(!registry.remove_if_empty(&handle).await);
        handle.leave(peer_id).await.unwrap();
        assert!(registry.remove_if_empty(&handle).await);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.handle(&room_id).is_none());

        let (req, _events) = request("bob");
        let (fresh, _ack) = registry.join(&room_id, meeting_id, req).await.unwrap();
        assert_ne!(fresh.router_id(), handle.router_id());
    }

    #[tokio::test]
    async fn test_join_after_close_lands_in_new_room() {
        let registry = registry(Arc::new(LoopbackEngine::new()));
        let room_id = RoomId::from("r-1");
        let meeting_id = MeetingId::new();

        let stale = registry.get_or_create(&room_id, meeting_id).await.unwrap();
        assert!(stale.close_if_empty().await.unwrap());

        let (req, _events) = request("alice");
        let (handle, _ack) = registry.join(&room_id, meeting_id, req).await.unwrap();
        assert_ne!(handle.router_id(), stale.router_id());
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_teardown_removes_room() {
        let registry = registry(Arc::new(LoopbackEngine::new()));
        let room_id = RoomId::from("r-1");
        let (req, mut events) = request("alice");
        registry.join(&room_id, MeetingId::new(), req).await.unwrap();

        registry.teardown(&room_id, "Meeting ended").await;
        assert_eq!(registry.room_count(), 0);
        assert!(matches!(
            events.recv().await,
            Some(crate::actors::messages::PeerEvent::MeetingEnded { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_rooms() {
        let registry = registry(Arc::new(LoopbackEngine::new()));
        let handle = registry
            .get_or_create(&RoomId::from("r-1"), MeetingId::new())
            .await
            .unwrap();

        registry.shutdown(Duration::from_secs(1)).await;
        assert!(handle.is_closed());
        assert!(!registry.is_accepting());
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.reap_finished(), 0);
    }
}
