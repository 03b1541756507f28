use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Outcome class of a handled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    /// The request was rejected before anything was started.
    FailedPrecondition,
    /// The command ran but failed, or its cleanup failed.
    Internal,
    /// The command was interrupted by the operator.
    Cancelled,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::FailedPrecondition => write!(f, "failed_precondition"),
            Self::Internal => write!(f, "internal"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Group description returned to callers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub instance_id: u32,
}

/// Summary of a created instance group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceGroupInfo {
    pub group_name: String,
    pub home_directories: Vec<String>,
    pub instances: Vec<InstanceInfo>,
}

impl InstanceGroupInfo {
    /// Device names in `<group>-<instance>` form, in instance order.
    pub fn device_names(&self) -> Vec<String> {
        self.instances
            .iter()
            .map(|i| format!("{}-{}", self.group_name, i.name))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<InstanceGroupInfo>,
}

impl Response {
    pub fn ok() -> Self {
        Self::with_status(Status::Ok, "")
    }

    pub fn with_status(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            group: None,
        }
    }

    /// Map a child exit code to a response. `None` means the child was
    /// killed by a signal.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::ok(),
            Some(code) => Self::with_status(
                Status::Internal,
                format!("process exited with code {}", code),
            ),
            None => Self::with_status(Status::Internal, "process was terminated by a signal"),
        }
    }

    pub fn with_group(mut self, group: InstanceGroupInfo) -> Self {
        self.group = Some(group);
        self
    }
}
