//! Inputs channel: keyboard scancodes and mouse events.
//!
//! Almost entirely outbound; the server only echoes modifier state.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{ChannelHandler, Connection};
use crate::error::SpiceError;
use crate::proto::{
    SPICE_MSGC_INPUTS_KEY_DOWN, SPICE_MSGC_INPUTS_KEY_MODIFIERS, SPICE_MSGC_INPUTS_KEY_UP,
    SPICE_MSGC_INPUTS_MOUSE_POSITION, SPICE_MSGC_INPUTS_MOUSE_PRESS,
    SPICE_MSGC_INPUTS_MOUSE_RELEASE, SPICE_MSG_INPUTS_INIT, SPICE_MSG_INPUTS_KEY_MODIFIERS,
    SPICE_MSG_INPUTS_MOUSE_MOTION_ACK,
};

/// Handle for injecting user input, handed to the driver via
/// [`crate::client::Driver::set_events_target`].
pub struct InputsChannel {
    conn: Arc<Connection>,
    /// Pressed-button mask; the lock is held across the send so the
    /// wire sees transitions in mask order.
    buttons: Mutex<u16>,
}

impl InputsChannel {
    pub(crate) fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(InputsChannel { conn, buttons: Mutex::new(0) })
    }

    /// Reset the keyboard LED state, sent once at connect.
    pub(crate) async fn announce_modifiers(&self) -> Result<(), SpiceError> {
        self.conn
            .send(SPICE_MSGC_INPUTS_KEY_MODIFIERS, &0u16.to_le_bytes())
            .await
    }

    /// Send a key press. `scancode` is up to 4 bytes, sent as-is.
    pub async fn key_down(&self, scancode: &[u8]) -> Result<(), SpiceError> {
        if scancode.is_empty() {
            return Ok(());
        }
        let mut code = [0u8; 4];
        let n = scancode.len().min(4);
        code[..n].copy_from_slice(&scancode[..n]);
        self.conn.send(SPICE_MSGC_INPUTS_KEY_DOWN, &code).await
    }

    /// Send a key release: the same scancode with the top bit of its
    /// last byte set.
    pub async fn key_up(&self, scancode: &[u8]) -> Result<(), SpiceError> {
        if scancode.is_empty() {
            return Ok(());
        }
        let mut code = [0u8; 4];
        let n = scancode.len().min(4);
        code[..n].copy_from_slice(&scancode[..n]);
        code[n - 1] |= 0x80;
        self.conn.send(SPICE_MSGC_INPUTS_KEY_UP, &code).await
    }

    /// Report an absolute mouse position (client mouse mode).
    pub async fn mouse_position(&self, x: u32, y: u32) -> Result<(), SpiceError> {
        let buttons = self.buttons.lock().await;
        let mut body = Vec::with_capacity(11);
        body.extend_from_slice(&x.to_le_bytes());
        body.extend_from_slice(&y.to_le_bytes());
        body.extend_from_slice(&buttons.to_le_bytes());
        body.push(0); // display id
        self.conn.send(SPICE_MSGC_INPUTS_MOUSE_POSITION, &body).await
    }

    /// Press a button (bit index). Duplicate presses are suppressed.
    pub async fn mouse_down(&self, button: u8) -> Result<(), SpiceError> {
        let mut buttons = self.buttons.lock().await;
        let state = 1u16 << button;
        if *buttons & state != 0 {
            debug!(button, "ignoring duplicate button press");
            return Ok(());
        }
        *buttons |= state;

        let mut body = Vec::with_capacity(3);
        body.push(button);
        body.extend_from_slice(&buttons.to_le_bytes());
        self.conn.send(SPICE_MSGC_INPUTS_MOUSE_PRESS, &body).await
    }

    /// Release a button. Releases without a press are suppressed.
    pub async fn mouse_up(&self, button: u8) -> Result<(), SpiceError> {
        let mut buttons = self.buttons.lock().await;
        let state = 1u16 << button;
        if *buttons & state == 0 {
            debug!(button, "ignoring release of unpressed button");
            return Ok(());
        }
        *buttons &= !state;

        let mut body = Vec::with_capacity(3);
        body.push(button);
        body.extend_from_slice(&buttons.to_le_bytes());
        self.conn.send(SPICE_MSGC_INPUTS_MOUSE_RELEASE, &body).await
    }

    /// Current pressed-button mask.
    pub async fn button_mask(&self) -> u16 {
        *self.buttons.lock().await
    }
}

#[async_trait]
impl ChannelHandler for InputsChannel {
    async fn handle(&self, typ: u16, data: &[u8]) {
        match typ {
            SPICE_MSG_INPUTS_INIT | SPICE_MSG_INPUTS_KEY_MODIFIERS => {
                // note: this field is 16 bits on the wire
                if data.len() >= 2 {
                    let modifiers = u16::from_le_bytes([data[0], data[1]]);
                    info!(modifiers, "key modifier state from server");
                }
            }
            SPICE_MSG_INPUTS_MOUSE_MOTION_ACK => {}
            other => warn!(typ = other, "unexpected inputs message"),
        }
    }
}
