//! Protocol dictionary: the catalog of commands and attributes understood
//! on the client-facing interface.
//!
//! Standard Diameter base attributes keep their well-known codes; MAGIC
//! application attributes live in the vendor space (leaf values 10xxx,
//! grouped 20xxx) under the ARINC 839 vendor id.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Vendor id used on all MAGIC application AVPs.
pub const MAGIC_VENDOR_ID: u32 = 839;
/// Application id carried in every message header.
pub const MAGIC_APPLICATION_ID: u32 = 16_777_839;

/// Value kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvpType {
    Utf8String,
    OctetString,
    Unsigned32,
    Unsigned64,
    Integer32,
    Float32,
    Address,
    Grouped,
}

/// Attribute codes.
pub mod avps {
    // Diameter base.
    pub const USER_NAME: u32 = 1;
    pub const SESSION_TIMEOUT: u32 = 27;
    pub const SESSION_ID: u32 = 263;
    pub const ORIGIN_HOST: u32 = 264;
    pub const RESULT_CODE: u32 = 268;
    pub const ERROR_MESSAGE: u32 = 281;
    pub const DESTINATION_REALM: u32 = 283;
    pub const ORIGIN_REALM: u32 = 296;

    // MAGIC application, leaf values.
    pub const MAGIC_STATUS_CODE: u32 = 10001;
    pub const REGISTERED_CLIENTS: u32 = 10002;
    pub const PROFILE_NAME: u32 = 10003;
    pub const DLM_NAME: u32 = 10004;
    pub const DLM_AVAILABLE: u32 = 10005;
    pub const DLM_MAX_BANDWIDTH: u32 = 10006;
    pub const DLM_ALLOCATED_BANDWIDTH: u32 = 10007;
    pub const DLM_MAX_RETURN_BANDWIDTH: u32 = 10008;
    pub const DLM_ALLOCATED_RETURN_BANDWIDTH: u32 = 10009;
    pub const DLM_MAX_LINKS: u32 = 10010;
    pub const DLM_ALLOCATED_LINKS: u32 = 10011;
    pub const QOS_LEVEL: u32 = 10012;
    pub const GRANTED_BANDWIDTH: u32 = 10013;
    pub const GRANTED_RETURN_BANDWIDTH: u32 = 10014;
    pub const REQUESTED_BANDWIDTH: u32 = 10015;
    pub const REQUESTED_RETURN_BANDWIDTH: u32 = 10016;
    pub const PRIORITY_TYPE: u32 = 10017;
    pub const PRIORITY_CLASS: u32 = 10018;
    pub const CLIENT_PASSWORD: u32 = 10020;
    pub const SERVER_PASSWORD: u32 = 10021;
    pub const FLIGHT_PHASE: u32 = 10022;
    pub const ALTITUDE: u32 = 10023;
    pub const GATEWAY_IP_ADDRESS: u32 = 10024;
    pub const LINK_NUMBER: u32 = 10025;
    pub const ACCOUNTING_ENABLED: u32 = 10026;
    pub const KEEP_REQUEST: u32 = 10027;
    pub const AUTO_DETECT: u32 = 10028;
    pub const AIRPORT: u32 = 10030;
    pub const ASSIGNED_IP_ADDRESS: u32 = 10031;
    pub const DNS_PRIMARY: u32 = 10032;
    pub const DNS_SECONDARY: u32 = 10033;
    pub const BANDWIDTH_CAP: u32 = 10034;
    pub const STATUS_SUBSCRIPTION_LEVEL: u32 = 10035;
    pub const ALTITUDE_RANGE: u32 = 10036;

    // MAGIC application, grouped.
    pub const COMM_REQUEST_PARAMETERS: u32 = 20001;
    pub const COMM_ANSWER_PARAMETERS: u32 = 20002;
    pub const COMM_REPORT_PARAMETERS: u32 = 20003;
    pub const DLM_LIST: u32 = 20007;
    pub const DLM_INFO: u32 = 20008;
    pub const DLM_QOS_LEVEL_LIST: u32 = 20009;
    pub const NETWORK_CONFIGURATION: u32 = 20012;
    pub const CLIENT_CREDENTIALS: u32 = 20019;
}

/// Command codes. Request vs. answer is carried by the R flag.
pub mod commands {
    /// MCAR / MCAA.
    pub const CLIENT_AUTHENTICATION: u32 = 9001;
    /// MCCR / MCCA.
    pub const COMMUNICATION: u32 = 9002;
    /// MNTR / MNTA (server-initiated).
    pub const MODIFY_NOTIFICATION: u32 = 9003;
    /// MSCR / MSCA — client subscription and server broadcast share the code.
    pub const STATUS_CHANGE: u32 = 9004;
    /// STR / STA (Diameter base session termination).
    pub const SESSION_TERMINATION: u32 = 275;
}

/// One attribute definition.
#[derive(Debug, Clone, Copy)]
pub struct AvpDef {
    pub code: u32,
    pub name: &'static str,
    pub typ: AvpType,
    pub mandatory: bool,
    pub vendor: bool,
}

/// One command definition with the AVPs a request must carry.
#[derive(Debug, Clone, Copy)]
pub struct CommandDef {
    pub code: u32,
    pub name: &'static str,
    pub required_request_avps: &'static [u32],
}

/// The protocol dictionary. Obtain the shared instance via [`dictionary`].
pub struct Dictionary {
    avps: HashMap<u32, AvpDef>,
    commands: HashMap<u32, CommandDef>,
}

impl Dictionary {
    pub fn lookup(&self, code: u32) -> Option<&AvpDef> {
        self.avps.get(&code)
    }

    pub fn command(&self, code: u32) -> Option<&CommandDef> {
        self.commands.get(&code)
    }

    pub fn is_mandatory(&self, code: u32) -> bool {
        self.avps.get(&code).map(|d| d.mandatory).unwrap_or(false)
    }

    pub fn vendor_of(&self, code: u32) -> Option<u32> {
        match self.avps.get(&code) {
            Some(def) if def.vendor => Some(MAGIC_VENDOR_ID),
            _ => None,
        }
    }

    pub fn name_of(&self, code: u32) -> &'static str {
        self.avps.get(&code).map(|d| d.name).unwrap_or("Unknown-AVP")
    }

    /// Check a decoded request against the catalog: known command, all
    /// required top-level AVPs present.
    pub fn validate_request(&self, msg: &crate::Message) -> Result<(), crate::ProtoError> {
        let def = self
            .command(msg.code)
            .ok_or(crate::ProtoError::UnknownCommand(msg.code))?;
        if !msg.request {
            return Ok(());
        }
        for &code in def.required_request_avps {
            if msg.find(code).is_none() {
                return Err(crate::ProtoError::MissingAvp(self.name_of(code)));
            }
        }
        Ok(())
    }
}

macro_rules! def {
    ($map:expr, $code:expr, $name:expr, $typ:expr, $mandatory:expr, $vendor:expr) => {
        $map.insert(
            $code,
            AvpDef {
                code: $code,
                name: $name,
                typ: $typ,
                mandatory: $mandatory,
                vendor: $vendor,
            },
        );
    };
}

static DICTIONARY: Lazy<Dictionary> = Lazy::new(|| {
    use avps::*;
    use AvpType::*;

    let mut a = HashMap::new();
    // Diameter base.
    def!(a, USER_NAME, "User-Name", Utf8String, true, false);
    def!(a, SESSION_TIMEOUT, "Session-Timeout", Unsigned32, false, false);
    def!(a, SESSION_ID, "Session-Id", Utf8String, true, false);
    def!(a, ORIGIN_HOST, "Origin-Host", Utf8String, false, false);
    def!(a, RESULT_CODE, "Result-Code", Unsigned32, true, false);
    def!(a, ERROR_MESSAGE, "Error-Message", Utf8String, false, false);
    def!(a, DESTINATION_REALM, "Destination-Realm", Utf8String, false, false);
    def!(a, ORIGIN_REALM, "Origin-Realm", Utf8String, false, false);

    // MAGIC leaves.
    def!(a, MAGIC_STATUS_CODE, "MAGIC-Status-Code", Unsigned32, true, true);
    def!(a, REGISTERED_CLIENTS, "Registered-Clients", Unsigned32, false, true);
    def!(a, PROFILE_NAME, "Profile-Name", Utf8String, true, true);
    def!(a, DLM_NAME, "DLM-Name", Utf8String, false, true);
    def!(a, DLM_AVAILABLE, "DLM-Available", Unsigned32, false, true);
    def!(a, DLM_MAX_BANDWIDTH, "DLM-Max-Bandwidth", Float32, false, true);
    def!(a, DLM_ALLOCATED_BANDWIDTH, "DLM-Allocated-Bandwidth", Float32, false, true);
    def!(a, DLM_MAX_RETURN_BANDWIDTH, "DLM-Max-Return-Bandwidth", Float32, false, true);
    def!(
        a,
        DLM_ALLOCATED_RETURN_BANDWIDTH,
        "DLM-Allocated-Return-Bandwidth",
        Float32,
        false,
        true
    );
    def!(a, DLM_MAX_LINKS, "DLM-Max-Links", Unsigned32, false, true);
    def!(a, DLM_ALLOCATED_LINKS, "DLM-Allocated-Links", Unsigned32, false, true);
    def!(a, QOS_LEVEL, "QoS-Level", Unsigned32, false, true);
    def!(a, GRANTED_BANDWIDTH, "Granted-Bandwidth", Float32, false, true);
    def!(a, GRANTED_RETURN_BANDWIDTH, "Granted-Return-Bandwidth", Float32, false, true);
    def!(a, REQUESTED_BANDWIDTH, "Requested-Bandwidth", Unsigned32, false, true);
    def!(
        a,
        REQUESTED_RETURN_BANDWIDTH,
        "Requested-Return-Bandwidth",
        Unsigned32,
        false,
        true
    );
    def!(a, PRIORITY_TYPE, "Priority-Type", Unsigned32, false, true);
    def!(a, PRIORITY_CLASS, "Priority-Class", Unsigned32, false, true);
    def!(a, CLIENT_PASSWORD, "Client-Password", Utf8String, true, true);
    def!(a, SERVER_PASSWORD, "Server-Password", Utf8String, false, true);
    def!(a, FLIGHT_PHASE, "Flight-Phase", Utf8String, false, true);
    def!(a, ALTITUDE, "Altitude", Unsigned32, false, true);
    def!(a, GATEWAY_IP_ADDRESS, "Gateway-IPAddress", Address, false, true);
    def!(a, LINK_NUMBER, "Link-Number", Unsigned32, false, true);
    def!(a, ACCOUNTING_ENABLED, "Accounting-Enabled", Unsigned32, false, true);
    def!(a, KEEP_REQUEST, "Keep-Request", Unsigned32, false, true);
    def!(a, AUTO_DETECT, "Auto-Detect", Unsigned32, false, true);
    def!(a, AIRPORT, "Airport", Utf8String, false, true);
    def!(a, ASSIGNED_IP_ADDRESS, "Assigned-IPAddress", Address, false, true);
    def!(a, DNS_PRIMARY, "DNS-Primary", Address, false, true);
    def!(a, DNS_SECONDARY, "DNS-Secondary", Address, false, true);
    def!(a, BANDWIDTH_CAP, "Bandwidth-Cap", Unsigned32, false, true);
    def!(
        a,
        STATUS_SUBSCRIPTION_LEVEL,
        "Status-Subscription-Level",
        Unsigned32,
        true,
        true
    );
    def!(a, ALTITUDE_RANGE, "Altitude-Range", Utf8String, false, true);

    // MAGIC groups.
    def!(
        a,
        COMM_REQUEST_PARAMETERS,
        "Communication-Request-Parameters",
        Grouped,
        true,
        true
    );
    def!(
        a,
        COMM_ANSWER_PARAMETERS,
        "Communication-Answer-Parameters",
        Grouped,
        false,
        true
    );
    def!(
        a,
        COMM_REPORT_PARAMETERS,
        "Communication-Report-Parameters",
        Grouped,
        false,
        true
    );
    def!(a, DLM_LIST, "DLM-List", Grouped, false, true);
    def!(a, DLM_INFO, "DLM-Info", Grouped, false, true);
    def!(a, DLM_QOS_LEVEL_LIST, "DLM-QoS-Level-List", Grouped, false, true);
    def!(a, NETWORK_CONFIGURATION, "Network-Configuration", Grouped, false, true);
    def!(a, CLIENT_CREDENTIALS, "Client-Credentials", Grouped, true, true);

    let mut c = HashMap::new();
    for cmd in [
        CommandDef {
            code: commands::CLIENT_AUTHENTICATION,
            name: "Client-Authentication",
            required_request_avps: &[avps::CLIENT_CREDENTIALS],
        },
        CommandDef {
            code: commands::COMMUNICATION,
            name: "Communication",
            required_request_avps: &[
                avps::SESSION_ID,
                avps::CLIENT_CREDENTIALS,
                avps::COMM_REQUEST_PARAMETERS,
            ],
        },
        CommandDef {
            code: commands::MODIFY_NOTIFICATION,
            name: "Modify-Notification",
            required_request_avps: &[avps::SESSION_ID, avps::COMM_REPORT_PARAMETERS],
        },
        CommandDef {
            code: commands::STATUS_CHANGE,
            name: "Status-Change",
            required_request_avps: &[avps::SESSION_ID],
        },
        CommandDef {
            code: commands::SESSION_TERMINATION,
            name: "Session-Termination",
            required_request_avps: &[avps::SESSION_ID],
        },
    ] {
        c.insert(cmd.code, cmd);
    }

    Dictionary { avps: a, commands: c }
});

/// The shared protocol dictionary.
pub fn dictionary() -> &'static Dictionary {
    &DICTIONARY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Avp, Message};

    #[test]
    fn vendor_split() {
        let dict = dictionary();
        assert_eq!(dict.vendor_of(avps::SESSION_ID), None);
        assert_eq!(dict.vendor_of(avps::PROFILE_NAME), Some(MAGIC_VENDOR_ID));
        assert_eq!(dict.vendor_of(avps::DLM_LIST), Some(MAGIC_VENDOR_ID));
    }

    #[test]
    fn names_resolve() {
        let dict = dictionary();
        assert_eq!(dict.name_of(avps::RESULT_CODE), "Result-Code");
        assert_eq!(dict.name_of(424242), "Unknown-AVP");
    }

    #[test]
    fn unknown_command_rejected() {
        let msg = Message::request(31337, vec![]);
        assert!(matches!(
            dictionary().validate_request(&msg),
            Err(crate::ProtoError::UnknownCommand(31337))
        ));
    }

    #[test]
    fn missing_required_avp_rejected() {
        let msg = Message::request(commands::COMMUNICATION, vec![]);
        assert!(matches!(
            dictionary().validate_request(&msg),
            Err(crate::ProtoError::MissingAvp("Session-Id"))
        ));
    }

    #[test]
    fn complete_request_accepted() {
        let msg = Message::request(
            commands::SESSION_TERMINATION,
            vec![Avp::utf8(avps::SESSION_ID, "ses_1")],
        );
        assert!(dictionary().validate_request(&msg).is_ok());
    }
}
