//! Dispatch Loop
//!
//! One task owns the [`Server`]; connections, request decoders and input
//! devices reach it through an mpsc channel. Each message is handled to
//! completion, then the loop runs its yield point: scheduler work, replay of
//! requests held for clients that have woken, and deferred close-downs.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dix::client::{ByteOrder, ClientState};
use crate::dix::device::{DeviceId, DeviceRole, Focus, InputClass};
use crate::dix::error::DixError;
use crate::dix::event::{EventRun, Timestamp};
use crate::dix::flags::{EventMask, ModifierMask};
use crate::dix::grab::{AllowMode, GrabError, GrabParams};
use crate::dix::registry::SelectionLevel;
use crate::dix::resource::{ClientId, WindowId, Xid};
use crate::dix::{SaveSetMode, Server};

const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

pub type DispatchTx = mpsc::Sender<DispatchMsg>;
pub type DispatchRx = mpsc::Receiver<DispatchMsg>;

pub fn channel() -> (DispatchTx, DispatchRx) {
    mpsc::channel(DEFAULT_CHANNEL_CAPACITY)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchMsg {
    /// New connection; the reply carries the allocated client id
    Connect {
        #[serde(default)]
        byte_order: ByteOrder,
        #[serde(skip)]
        reply: Option<oneshot::Sender<Result<ClientId, DixError>>>,
    },
    Request {
        client: ClientId,
        request: Request,
    },
    Input {
        device: DeviceId,
        events: EventRun,
    },
    AddDevice {
        name: String,
        class: InputClass,
        /// Attach to this master instead of creating a master
        #[serde(default)]
        master: Option<DeviceId>,
        /// Pair a new master keyboard with this pointer
        #[serde(default)]
        pair_with: Option<DeviceId>,
    },
    Disconnect {
        client: ClientId,
    },
}

fn yes() -> bool {
    true
}

/// Decoded protocol requests the core handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateWindow {
        window: WindowId,
        parent: WindowId,
    },
    DestroyWindow {
        window: WindowId,
    },
    MapWindow {
        window: WindowId,
    },
    ReparentWindow {
        window: WindowId,
        parent: WindowId,
    },
    SelectInput {
        window: WindowId,
        mask: EventMask,
        #[serde(default)]
        level: SelectionLevel,
    },
    SuppressEvents {
        window: WindowId,
        mask: EventMask,
    },
    GrabDevice {
        device: DeviceId,
        params: GrabParams,
    },
    UngrabDevice {
        device: DeviceId,
        #[serde(default)]
        time: Timestamp,
    },
    AllowEvents {
        device: DeviceId,
        mode: AllowMode,
        #[serde(default)]
        time: Timestamp,
    },
    GrabButton {
        device: DeviceId,
        button: u8,
        #[serde(default)]
        modifiers: ModifierMask,
        params: GrabParams,
    },
    UngrabButton {
        device: DeviceId,
        window: WindowId,
        button: u8,
        #[serde(default)]
        modifiers: ModifierMask,
    },
    GrabKey {
        device: DeviceId,
        keycode: u8,
        #[serde(default)]
        modifiers: ModifierMask,
        params: GrabParams,
    },
    UngrabKey {
        device: DeviceId,
        window: WindowId,
        keycode: u8,
        #[serde(default)]
        modifiers: ModifierMask,
    },
    ChangeSaveSet {
        window: WindowId,
        mode: SaveSetMode,
        #[serde(default)]
        to_root: bool,
        #[serde(default = "yes")]
        map: bool,
    },
    SetInputFocus {
        device: DeviceId,
        focus: Focus,
        #[serde(default)]
        time: Timestamp,
    },
    WaitForThaw {
        device: DeviceId,
    },
}

impl Request {
    /// Major opcode reported in errors.
    pub fn major(&self) -> u8 {
        match self {
            Self::CreateWindow { .. } => 1,
            Self::SelectInput { .. } | Self::SuppressEvents { .. } => 2,
            Self::DestroyWindow { .. } => 4,
            Self::ChangeSaveSet { .. } => 6,
            Self::ReparentWindow { .. } => 7,
            Self::MapWindow { .. } => 8,
            Self::GrabDevice { .. } => 26,
            Self::UngrabDevice { .. } => 27,
            Self::GrabButton { .. } => 28,
            Self::UngrabButton { .. } => 29,
            Self::GrabKey { .. } => 33,
            Self::UngrabKey { .. } => 34,
            Self::AllowEvents { .. } => 35,
            Self::SetInputFocus { .. } => 42,
            // input extension
            Self::WaitForThaw { .. } => 131,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    /// False when the map was redirected to another client
    Mapped(bool),
    /// Grab reply status, zero for success
    GrabStatus(u8),
    Removed(usize),
    Resource(Xid),
    Destroyed(Vec<WindowId>),
    Sleeping(bool),
}

impl Server {
    /// Run one decoded request on behalf of `client`.
    pub fn handle_request(&mut self, client: ClientId, request: Request) -> Result<Reply, DixError> {
        match request {
            Request::CreateWindow { window, parent } => {
                self.create_window(client, window, parent).map(|_| Reply::Done)
            }
            Request::DestroyWindow { window } => self.destroy_window(window).map(Reply::Destroyed),
            Request::MapWindow { window } => self.map_window(client, window).map(Reply::Mapped),
            Request::ReparentWindow { window, parent } => {
                self.reparent_window(window, parent).map(|_| Reply::Done)
            }
            Request::SelectInput {
                window,
                mask,
                level,
            } => self.select_events(window, client, mask, level).map(|_| Reply::Done),
            Request::SuppressEvents { window, mask } => {
                self.suppress_events(window, client, mask).map(|_| Reply::Done)
            }
            Request::GrabDevice { device, params } => match self.grab_device(client, device, params) {
                Ok(()) => Ok(Reply::GrabStatus(0)),
                Err(GrabError::Refused(refusal)) => Ok(Reply::GrabStatus(refusal.status())),
                Err(GrabError::Protocol(err)) => Err(err),
            },
            Request::UngrabDevice { device, time } => {
                self.ungrab_device(client, device, time).map(|_| Reply::Done)
            }
            Request::AllowEvents { device, mode, time } => {
                self.allow_some(client, device, time, mode).map(|_| Reply::Done)
            }
            Request::GrabButton {
                device,
                button,
                modifiers,
                params,
            } => self
                .grab_button(client, device, button, modifiers, params)
                .map(Reply::Resource),
            Request::UngrabButton {
                device,
                window,
                button,
                modifiers,
            } => self
                .ungrab_button(client, device, window, button, modifiers)
                .map(Reply::Removed),
            Request::GrabKey {
                device,
                keycode,
                modifiers,
                params,
            } => self
                .grab_key(client, device, keycode, modifiers, params)
                .map(Reply::Resource),
            Request::UngrabKey {
                device,
                window,
                keycode,
                modifiers,
            } => self
                .ungrab_key(client, device, window, keycode, modifiers)
                .map(Reply::Removed),
            Request::ChangeSaveSet {
                window,
                mode,
                to_root,
                map,
            } => self
                .alter_save_set(client, window, mode, to_root, map)
                .map(|_| Reply::Done),
            Request::SetInputFocus { device, focus, time } => {
                self.set_input_focus(client, device, focus, time).map(|_| Reply::Done)
            }
            Request::WaitForThaw { device } => self.wait_for_thaw(client, device).map(Reply::Sleeping),
        }
    }
}

pub struct Dispatcher {
    server: Server,
    rx: DispatchRx,
    /// Requests from asleep clients, replayed in order once they wake
    backlog: HashMap<ClientId, VecDeque<Request>>,
}

impl Dispatcher {
    pub fn new(server: Server, rx: DispatchRx) -> Self {
        Self {
            server,
            rx,
            backlog: HashMap::new(),
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Process messages until every sender is gone, then hand the core back.
    pub async fn run(mut self) -> Server {
        info!("Dispatch loop started");
        while let Some(msg) = self.rx.recv().await {
            self.dispatch(msg);
        }
        info!("Dispatch loop finished");
        self.server
    }

    /// Handle one message and run the yield point.
    pub fn dispatch(&mut self, msg: DispatchMsg) {
        self.handle(msg);
        self.yield_point();
    }

    fn handle(&mut self, msg: DispatchMsg) {
        match msg {
            DispatchMsg::Connect { byte_order, reply } => {
                let result = self.server.register_client(byte_order);
                match reply {
                    Some(tx) => {
                        if tx.send(result).is_err() {
                            debug!("Connection went away before its client id was sent");
                        }
                    }
                    None => {
                        if let Err(e) = result {
                            warn!("Connection refused: {}", e);
                        }
                    }
                }
            }
            DispatchMsg::Request { client, request } => self.submit(client, request),
            DispatchMsg::Input { device, events } => {
                match self.server.process_input(device, events) {
                    Ok(outcome) => debug!(device = ?device, ?outcome, "input routed"),
                    Err(e) => warn!(device = ?device, "Dropping input: {}", e),
                }
            }
            DispatchMsg::AddDevice {
                name,
                class,
                master,
                pair_with,
            } => {
                let role = match master {
                    Some(master) => DeviceRole::Slave { master },
                    None => DeviceRole::Master,
                };
                let id = self.server.add_device(&name, class, role);
                if let Some(pointer) = pair_with {
                    if let Err(e) = self.server.pair_devices(pointer, id) {
                        warn!(device = ?id, "Failed to pair device: {}", e);
                    }
                }
            }
            DispatchMsg::Disconnect { client } => {
                self.backlog.remove(&client);
                if let Err(e) = self.server.destroy_client(client) {
                    debug!(client = ?client, "Disconnect ignored: {}", e);
                }
            }
        }
    }

    fn submit(&mut self, client: ClientId, request: Request) {
        let Some(state) = self.server.directory().client(client).map(|c| c.state()) else {
            warn!(client = ?client, "Request from unknown client dropped");
            return;
        };
        let held = self.backlog.get(&client).is_some_and(|q| !q.is_empty());
        match state {
            ClientState::Asleep => self.backlog.entry(client).or_default().push_back(request),
            ClientState::Running if held => {
                self.backlog.entry(client).or_default().push_back(request)
            }
            ClientState::Running => self.execute(client, request),
            ClientState::CloseDown => {}
        }
    }

    fn execute(&mut self, client: ClientId, request: Request) {
        let major = request.major();
        match self.server.handle_request(client, request) {
            Ok(reply) => debug!(client = ?client, major, ?reply, "request done"),
            Err(err) => {
                debug!(client = ?client, major, "request failed: {}", err);
                self.server.send_dix_error(client, major, &err);
            }
        }
    }

    fn is_dispatchable(&self, client: ClientId) -> bool {
        self.server
            .directory()
            .client(client)
            .is_some_and(|c| c.is_dispatchable())
    }

    fn yield_point(&mut self) {
        for client in self.server.process_work_queue() {
            debug!(client = ?client, "client resumed");
        }
        let mut ready: Vec<ClientId> = self.backlog.keys().copied().collect();
        ready.sort();
        for client in ready {
            self.drain_backlog(client);
        }
        for client in self.server.close_down_pending() {
            self.backlog.remove(&client);
        }
        let server = &self.server;
        self.backlog
            .retain(|client, queue| !queue.is_empty() && server.directory().client(*client).is_some());
    }

    fn drain_backlog(&mut self, client: ClientId) {
        while self.is_dispatchable(client) {
            let Some(request) = self.backlog.get_mut(&client).and_then(VecDeque::pop_front) else {
                break;
            };
            self.execute(client, request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dix::event::{EventKind, LogicalEvent};
    use crate::dix::sink::RecordingSink;
    use crate::dix::window::WindowTree;
    use crate::dix::CoreOptions;
    use pretty_assertions::assert_eq;

    const ROOT: Xid = Xid(1);
    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);
    const POINTER: DeviceId = DeviceId(1);
    const FRAME: Xid = Xid(0x0020_0001);

    fn server(sink: &RecordingSink) -> Server {
        Server::new(
            CoreOptions::default(),
            Box::new(WindowTree::new(ROOT)),
            Box::new(sink.clone()),
        )
        .unwrap()
    }

    fn connect() -> DispatchMsg {
        DispatchMsg::Connect {
            byte_order: ByteOrder::native(),
            reply: None,
        }
    }

    fn request(client: ClientId, request: Request) -> DispatchMsg {
        DispatchMsg::Request { client, request }
    }

    fn press(window: Xid) -> DispatchMsg {
        DispatchMsg::Input {
            device: POINTER,
            events: LogicalEvent::new(window, EventKind::ButtonPress { button: 1 }).into(),
        }
    }

    fn setup(dispatcher: &mut Dispatcher) {
        dispatcher.dispatch(connect());
        dispatcher.dispatch(connect());
        dispatcher.dispatch(DispatchMsg::AddDevice {
            name: "pointer".into(),
            class: InputClass::Pointer,
            master: None,
            pair_with: None,
        });
        dispatcher.dispatch(request(A, Request::CreateWindow { window: FRAME, parent: ROOT }));
        dispatcher.dispatch(request(A, Request::MapWindow { window: FRAME }));
    }

    #[test]
    fn asleep_client_requests_wait_for_thaw() {
        let sink = RecordingSink::new();
        let (_tx, rx) = channel();
        let mut dispatcher = Dispatcher::new(server(&sink), rx);
        setup(&mut dispatcher);

        let params = GrabParams::new(FRAME, EventMask::BUTTON_PRESS).synchronous();
        dispatcher.dispatch(request(A, Request::GrabDevice { device: POINTER, params }));
        dispatcher.dispatch(press(FRAME));
        dispatcher.dispatch(request(B, Request::WaitForThaw { device: POINTER }));
        assert!(dispatcher.server().client_is_asleep(B));

        let select = Request::SelectInput {
            window: ROOT,
            mask: EventMask::POINTER_MOTION,
            level: SelectionLevel::Core,
        };
        dispatcher.dispatch(request(B, select));
        assert_eq!(dispatcher.server().event_mask_for_client(ROOT, B), EventMask::empty());

        dispatcher.dispatch(request(
            A,
            Request::AllowEvents {
                device: POINTER,
                mode: AllowMode::Async,
                time: Timestamp::CURRENT,
            },
        ));
        assert!(!dispatcher.server().client_is_asleep(B));
        assert_eq!(
            dispatcher.server().event_mask_for_client(ROOT, B),
            EventMask::POINTER_MOTION
        );
        assert_eq!(sink.count(A), 1);
    }

    #[test]
    fn failed_requests_send_errors() {
        let sink = RecordingSink::new();
        let (_tx, rx) = channel();
        let mut dispatcher = Dispatcher::new(server(&sink), rx);
        setup(&mut dispatcher);

        let missing = Xid(0x0040_0009);
        dispatcher.dispatch(request(B, Request::MapWindow { window: missing }));
        let sent = sink.sent(B);
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].body,
            crate::dix::event::WireBody::Error {
                code: 3,
                major: 8,
                minor: 0,
                resource: missing.0,
            }
        );

        // grab refusals are replies, not errors
        let params = GrabParams::new(FRAME, EventMask::BUTTON_PRESS);
        dispatcher.dispatch(request(A, Request::GrabDevice { device: POINTER, params: params.clone() }));
        dispatcher.dispatch(request(B, Request::GrabDevice { device: POINTER, params }));
        assert_eq!(sink.count(B), 1);
    }

    #[test]
    fn transport_failure_closes_the_client_at_the_yield_point() {
        let sink = RecordingSink::new();
        let (_tx, rx) = channel();
        let mut dispatcher = Dispatcher::new(server(&sink), rx);
        setup(&mut dispatcher);
        dispatcher.dispatch(request(
            B,
            Request::SelectInput {
                window: FRAME,
                mask: EventMask::BUTTON_PRESS,
                level: SelectionLevel::Core,
            },
        ));
        sink.fail_client(B);
        dispatcher.dispatch(press(FRAME));
        assert!(dispatcher.server().directory().client(B).is_none());
        assert!(!dispatcher.server().references_client(B));
    }

    #[tokio::test]
    async fn script_runs_through_the_channel() {
        let script = r#"[
            {"type": "connect"},
            {"type": "connect"},
            {"type": "add_device", "name": "pointer", "class": "pointer"},
            {"type": "request", "client": 1, "request": {"op": "create_window", "window": 2097153, "parent": 1}},
            {"type": "request", "client": 1, "request": {"op": "map_window", "window": 2097153}},
            {"type": "request", "client": 2, "request": {"op": "select_input", "window": 2097153, "mask": "BUTTON_PRESS | BUTTON_RELEASE"}},
            {"type": "input", "device": 1, "events": [{"window": 2097153, "kind": {"type": "button_press", "button": 1}}]},
            {"type": "input", "device": 1, "events": [{"window": 2097153, "state": "BUTTON1", "kind": {"type": "button_release", "button": 1}}]},
            {"type": "disconnect", "client": 1}
        ]"#;
        let messages: Vec<DispatchMsg> = serde_json::from_str(script).unwrap();
        let sink = RecordingSink::new();
        let (tx, rx) = channel();
        let task = tokio::spawn(Dispatcher::new(server(&sink), rx).run());
        for msg in messages {
            tx.send(msg).await.unwrap();
        }
        drop(tx);
        let server = task.await.unwrap();

        // no structure selection, so the frame's destruction sends nothing
        let kinds: Vec<EventKind> = sink.events(B).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds.len(), 2);
        assert!(server.directory().client(A).is_none());
        assert!(server.devices().get(POINTER).unwrap().grab().is_none());
    }

    #[tokio::test]
    async fn connect_replies_with_the_client_id() {
        let sink = RecordingSink::new();
        let (tx, rx) = channel();
        let task = tokio::spawn(Dispatcher::new(server(&sink), rx).run());
        let (reply, id) = oneshot::channel();
        tx.send(DispatchMsg::Connect {
            byte_order: ByteOrder::BigEndian,
            reply: Some(reply),
        })
        .await
        .unwrap();
        assert_eq!(id.await.unwrap(), Ok(A));
        drop(tx);
        let server = task.await.unwrap();
        assert_eq!(
            server.directory().client(A).map(|c| c.byte_order()),
            Some(ByteOrder::BigEndian)
        );
    }
}
