/// Opcodes carried by control frames sent from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlOpcode {
    Init = 1,
    Load = 2,
    Terminate = 3,
    GetLatencyStats = 4,
    GetFailureStats = 5,
    GetExecutionStats = 6,
    GetLcbExceptions = 7,
    SetFilter = 8,
    SetTimerFilter = 9,
    ClearTimerFilter = 10,
    ResetCheckpoint = 11,
    GetCheckpoint = 12,
    StartDebugger = 13,
    StopDebugger = 14,
}

impl ControlOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        let opcode = match value {
            1 => ControlOpcode::Init,
            2 => ControlOpcode::Load,
            3 => ControlOpcode::Terminate,
            4 => ControlOpcode::GetLatencyStats,
            5 => ControlOpcode::GetFailureStats,
            6 => ControlOpcode::GetExecutionStats,
            7 => ControlOpcode::GetLcbExceptions,
            8 => ControlOpcode::SetFilter,
            9 => ControlOpcode::SetTimerFilter,
            10 => ControlOpcode::ClearTimerFilter,
            11 => ControlOpcode::ResetCheckpoint,
            12 => ControlOpcode::GetCheckpoint,
            13 => ControlOpcode::StartDebugger,
            14 => ControlOpcode::StopDebugger,
            _ => return None,
        };
        Some(opcode)
    }
}

/// Opcodes of frames the worker sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseOpcode {
    Ack = 1,
    EventSuccess = 2,
    EventFailure = 3,
    CreateTimer = 4,
    Stats = 5,
    Checkpoint = 6,
}

impl ResponseOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        let opcode = match value {
            1 => ResponseOpcode::Ack,
            2 => ResponseOpcode::EventSuccess,
            3 => ResponseOpcode::EventFailure,
            4 => ResponseOpcode::CreateTimer,
            5 => ResponseOpcode::Stats,
            6 => ResponseOpcode::Checkpoint,
            _ => return None,
        };
        Some(opcode)
    }
}
