use serde::{Deserialize, Serialize};
use std::fmt;

/// Secondary snapshots kept next to an item's trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shadow {
    /// Last state both server and local edits agreed on.
    Base,
    /// Server state that could not be merged automatically.
    Conflict,
    /// Newest server state not merged yet.
    Download,
    /// Server-acknowledged state after an upload, not merged yet.
    DoneUpload,
    /// State frozen when an upload started. Marks the item as transmitting.
    UploadTask,
}

impl Shadow {
    pub const ALL: [Shadow; 5] = [
        Shadow::Base,
        Shadow::Conflict,
        Shadow::Download,
        Shadow::DoneUpload,
        Shadow::UploadTask,
    ];

    /// Storage column holding this snapshot.
    pub fn column(self) -> &'static str {
        match self {
            Shadow::Base => "base",
            Shadow::Conflict => "conflict",
            Shadow::Download => "download",
            Shadow::DoneUpload => "done_upload",
            Shadow::UploadTask => "upload_task",
        }
    }
}

impl fmt::Display for Shadow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}
