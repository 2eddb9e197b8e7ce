//! Opcodes of the built-in messages.

use mesh_wire::Opcode;

/// Config AppKey Add
pub const CONFIG_APPKEY_ADD: Opcode = Opcode::Single(0x00);
/// Config AppKey Status
pub const CONFIG_APPKEY_STATUS: Opcode = Opcode::Double(0x8003);
/// Config Composition Data Get
pub const CONFIG_COMPOSITION_DATA_GET: Opcode = Opcode::Double(0x8008);
/// Config Composition Data Status
pub const CONFIG_COMPOSITION_DATA_STATUS: Opcode = Opcode::Single(0x02);
/// Config Model App Bind
pub const CONFIG_MODEL_APP_BIND: Opcode = Opcode::Double(0x803D);
/// Config Model App Status
pub const CONFIG_MODEL_APP_STATUS: Opcode = Opcode::Double(0x803E);
/// Config Model Subscription Add
pub const CONFIG_MODEL_SUBSCRIPTION_ADD: Opcode = Opcode::Double(0x801B);
/// Config Model Subscription Status
pub const CONFIG_MODEL_SUBSCRIPTION_STATUS: Opcode = Opcode::Double(0x801F);
/// Config Node Reset
pub const CONFIG_NODE_RESET: Opcode = Opcode::Double(0x8049);
/// Config Node Reset Status
pub const CONFIG_NODE_RESET_STATUS: Opcode = Opcode::Double(0x804A);

/// Generic OnOff Get
pub const GENERIC_ONOFF_GET: Opcode = Opcode::Double(0x8201);
/// Generic OnOff Set
pub const GENERIC_ONOFF_SET: Opcode = Opcode::Double(0x8202);
/// Generic OnOff Set Unacknowledged
pub const GENERIC_ONOFF_SET_UNACKNOWLEDGED: Opcode = Opcode::Double(0x8203);
/// Generic OnOff Status
pub const GENERIC_ONOFF_STATUS: Opcode = Opcode::Double(0x8204);
/// Generic Level Get
pub const GENERIC_LEVEL_GET: Opcode = Opcode::Double(0x8205);
/// Generic Level Set
pub const GENERIC_LEVEL_SET: Opcode = Opcode::Double(0x8206);
/// Generic Level Set Unacknowledged
pub const GENERIC_LEVEL_SET_UNACKNOWLEDGED: Opcode = Opcode::Double(0x8207);
/// Generic Level Status
pub const GENERIC_LEVEL_STATUS: Opcode = Opcode::Double(0x8208);
