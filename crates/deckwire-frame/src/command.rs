//! Well-known command ids and the event types they publish under.
//!
//! The core names events by command; it never interprets payloads.

use std::borrow::Cow;

/// Button pressed or released.
pub const BUTTON_PRESS: u8 = 0x00;

/// Knob rotated.
pub const KNOB_ROTATE: u8 = 0x01;

/// Set a button's LED colour.
pub const SET_COLOR: u8 = 0x02;

/// Query the device serial number.
pub const SERIAL: u8 = 0x03;

/// Reset the device.
pub const RESET: u8 = 0x06;

/// Query the firmware version. Also used as the keepalive probe.
pub const VERSION: u8 = 0x07;

/// Set display brightness.
pub const SET_BRIGHTNESS: u8 = 0x09;

/// MCU information.
pub const MCU: u8 = 0x0d;

/// Flush a framebuffer region to a display.
pub const DRAW: u8 = 0x0f;

/// Write pixels into a framebuffer.
pub const FRAMEBUFF: u8 = 0x10;

/// Trigger haptic feedback.
pub const SET_VIBRATION: u8 = 0x1b;

/// Touch started or moved.
pub const TOUCH: u8 = 0x4d;

/// Touch on the round knob display.
pub const TOUCH_CT: u8 = 0x52;

/// Touch ended.
pub const TOUCH_END: u8 = 0x6d;

/// Touch ended on the round knob display.
pub const TOUCH_END_CT: u8 = 0x72;

/// Lifecycle event published after a link is established.
pub const CONNECT_EVENT: &str = "connect";

/// Lifecycle event published after a link is lost or closed.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Event type an unsolicited message with `command` is published under.
pub fn event_type(command: u8) -> Cow<'static, str> {
    match command {
        BUTTON_PRESS => Cow::Borrowed("button"),
        KNOB_ROTATE => Cow::Borrowed("rotate"),
        TOUCH | TOUCH_CT => Cow::Borrowed("touch"),
        TOUCH_END | TOUCH_END_CT => Cow::Borrowed("touchend"),
        other => Cow::Owned(format!("command:{other:#04x}")),
    }
}

/// Returns a human-readable name for a command id.
pub fn command_name(command: u8) -> &'static str {
    match command {
        BUTTON_PRESS => "BUTTON_PRESS",
        KNOB_ROTATE => "KNOB_ROTATE",
        SET_COLOR => "SET_COLOR",
        SERIAL => "SERIAL",
        RESET => "RESET",
        VERSION => "VERSION",
        SET_BRIGHTNESS => "SET_BRIGHTNESS",
        MCU => "MCU",
        DRAW => "DRAW",
        FRAMEBUFF => "FRAMEBUFF",
        SET_VIBRATION => "SET_VIBRATION",
        TOUCH => "TOUCH",
        TOUCH_CT => "TOUCH_CT",
        TOUCH_END => "TOUCH_END",
        TOUCH_END_CT => "TOUCH_END_CT",
        _ => "UNKNOWN",
    }
}
