//! The closed opcode set of the wireless-device protocol.
//!
//! Values are fixed by the desktop driver; the integer travels as the first
//! element of every control frame.

/// All opcodes the protocol defines.
///
/// The set is closed: an integer outside it is a framing error, and a known
/// opcode arriving in the wrong phase gets an `Error` reply from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Ok,
    SetCalibreDeviceInfo,
    SetCalibreDeviceName,
    GetDeviceInformation,
    TotalSpace,
    FreeSpace,
    GetBookCount,
    SendBooklists,
    SendBook,
    GetInitializationInfo,
    BookDone,
    Noop,
    DeleteBook,
    GetBookFileSegment,
    GetBookMetadata,
    SendBookMetadata,
    DisplayMessage,
    CalibreBusy,
    SetLibraryInfo,
    Error,
}

impl Opcode {
    /// Map a wire integer to an opcode. `None` for integers outside the set.
    pub fn from_wire(value: i64) -> Option<Self> {
        Some(match value {
            0 => Opcode::Ok,
            1 => Opcode::SetCalibreDeviceInfo,
            2 => Opcode::SetCalibreDeviceName,
            3 => Opcode::GetDeviceInformation,
            4 => Opcode::TotalSpace,
            5 => Opcode::FreeSpace,
            6 => Opcode::GetBookCount,
            7 => Opcode::SendBooklists,
            8 => Opcode::SendBook,
            9 => Opcode::GetInitializationInfo,
            11 => Opcode::BookDone,
            12 => Opcode::Noop,
            13 => Opcode::DeleteBook,
            14 => Opcode::GetBookFileSegment,
            15 => Opcode::GetBookMetadata,
            16 => Opcode::SendBookMetadata,
            17 => Opcode::DisplayMessage,
            18 => Opcode::CalibreBusy,
            19 => Opcode::SetLibraryInfo,
            20 => Opcode::Error,
            _ => return None,
        })
    }

    /// The integer sent on the wire for this opcode.
    pub fn as_wire(self) -> i64 {
        match self {
            Opcode::Ok => 0,
            Opcode::SetCalibreDeviceInfo => 1,
            Opcode::SetCalibreDeviceName => 2,
            Opcode::GetDeviceInformation => 3,
            Opcode::TotalSpace => 4,
            Opcode::FreeSpace => 5,
            Opcode::GetBookCount => 6,
            Opcode::SendBooklists => 7,
            Opcode::SendBook => 8,
            Opcode::GetInitializationInfo => 9,
            Opcode::BookDone => 11,
            Opcode::Noop => 12,
            Opcode::DeleteBook => 13,
            Opcode::GetBookFileSegment => 14,
            Opcode::GetBookMetadata => 15,
            Opcode::SendBookMetadata => 16,
            Opcode::DisplayMessage => 17,
            Opcode::CalibreBusy => 18,
            Opcode::SetLibraryInfo => 19,
            Opcode::Error => 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[Opcode] = &[
        Opcode::Ok,
        Opcode::SetCalibreDeviceInfo,
        Opcode::SetCalibreDeviceName,
        Opcode::GetDeviceInformation,
        Opcode::TotalSpace,
        Opcode::FreeSpace,
        Opcode::GetBookCount,
        Opcode::SendBooklists,
        Opcode::SendBook,
        Opcode::GetInitializationInfo,
        Opcode::BookDone,
        Opcode::Noop,
        Opcode::DeleteBook,
        Opcode::GetBookFileSegment,
        Opcode::GetBookMetadata,
        Opcode::SendBookMetadata,
        Opcode::DisplayMessage,
        Opcode::CalibreBusy,
        Opcode::SetLibraryInfo,
        Opcode::Error,
    ];

    #[test]
    fn wire_mapping_round_trips() {
        for op in ALL {
            assert_eq!(Opcode::from_wire(op.as_wire()), Some(*op));
        }
    }

    #[test]
    fn known_values_match_driver_constants() {
        assert_eq!(Opcode::Ok.as_wire(), 0);
        assert_eq!(Opcode::GetBookCount.as_wire(), 6);
        assert_eq!(Opcode::SendBook.as_wire(), 8);
        assert_eq!(Opcode::GetInitializationInfo.as_wire(), 9);
        assert_eq!(Opcode::Noop.as_wire(), 12);
        assert_eq!(Opcode::Error.as_wire(), 20);
    }

    #[test]
    fn unassigned_values_are_rejected() {
        assert_eq!(Opcode::from_wire(10), None);
        assert_eq!(Opcode::from_wire(21), None);
        assert_eq!(Opcode::from_wire(-1), None);
    }
}
