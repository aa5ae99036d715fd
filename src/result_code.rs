//! LDAP result codes (RFC 4511 §4.1.9) and the client-side codes used by
//! libldap-style APIs, with their human readable renderings.

pub const SUCCESS: i32 = 0;
pub const OPERATIONS_ERROR: i32 = 1;
pub const PROTOCOL_ERROR: i32 = 2;
pub const TIME_LIMIT_EXCEEDED: i32 = 3;
pub const SIZE_LIMIT_EXCEEDED: i32 = 4;
pub const COMPARE_FALSE: i32 = 5;
pub const COMPARE_TRUE: i32 = 6;
pub const AUTH_METHOD_NOT_SUPPORTED: i32 = 7;
pub const STRONGER_AUTH_REQUIRED: i32 = 8;
pub const PARTIAL_RESULTS: i32 = 9;
pub const REFERRAL: i32 = 10;
pub const ADMIN_LIMIT_EXCEEDED: i32 = 11;
pub const UNAVAILABLE_CRITICAL_EXTENSION: i32 = 12;
pub const CONFIDENTIALITY_REQUIRED: i32 = 13;
pub const SASL_BIND_IN_PROGRESS: i32 = 14;
pub const NO_SUCH_ATTRIBUTE: i32 = 16;
pub const UNDEFINED_TYPE: i32 = 17;
pub const INAPPROPRIATE_MATCHING: i32 = 18;
pub const CONSTRAINT_VIOLATION: i32 = 19;
pub const TYPE_OR_VALUE_EXISTS: i32 = 20;
pub const INVALID_SYNTAX: i32 = 21;
pub const NO_SUCH_OBJECT: i32 = 32;
pub const ALIAS_PROBLEM: i32 = 33;
pub const INVALID_DN_SYNTAX: i32 = 34;
pub const IS_LEAF: i32 = 35;
pub const ALIAS_DEREF_PROBLEM: i32 = 36;
pub const PROXY_AUTHZ_FAILURE: i32 = 47;
pub const INAPPROPRIATE_AUTH: i32 = 48;
pub const INVALID_CREDENTIALS: i32 = 49;
pub const INSUFFICIENT_ACCESS: i32 = 50;
pub const BUSY: i32 = 51;
pub const UNAVAILABLE: i32 = 52;
pub const UNWILLING_TO_PERFORM: i32 = 53;
pub const LOOP_DETECT: i32 = 54;
pub const NAMING_VIOLATION: i32 = 64;
pub const OBJECT_CLASS_VIOLATION: i32 = 65;
pub const NOT_ALLOWED_ON_NONLEAF: i32 = 66;
pub const NOT_ALLOWED_ON_RDN: i32 = 67;
pub const ALREADY_EXISTS: i32 = 68;
pub const NO_OBJECT_CLASS_MODS: i32 = 69;
pub const RESULTS_TOO_LARGE: i32 = 70;
pub const AFFECTS_MULTIPLE_DSAS: i32 = 71;
pub const VLV_ERROR: i32 = 76;
pub const OTHER: i32 = 80;
pub const CANCELLED: i32 = 118;
pub const NO_SUCH_OPERATION: i32 = 119;
pub const TOO_LATE: i32 = 120;
pub const CANNOT_CANCEL: i32 = 121;
pub const ASSERTION_FAILED: i32 = 122;
pub const PROXIED_AUTHORIZATION_DENIED: i32 = 123;
pub const SYNC_REFRESH_REQUIRED: i32 = 4096;

// Client-side (API) codes, negative as in libldap.
pub const SERVER_DOWN: i32 = -1;
pub const LOCAL_ERROR: i32 = -2;
pub const ENCODING_ERROR: i32 = -3;
pub const DECODING_ERROR: i32 = -4;
pub const TIMEOUT: i32 = -5;
pub const AUTH_UNKNOWN: i32 = -6;
pub const FILTER_ERROR: i32 = -7;
pub const USER_CANCELLED: i32 = -8;
pub const PARAM_ERROR: i32 = -9;
pub const NO_MEMORY: i32 = -10;
pub const CONNECT_ERROR: i32 = -11;
pub const NOT_SUPPORTED: i32 = -12;
pub const CONTROL_NOT_FOUND: i32 = -13;
pub const NO_RESULTS_RETURNED: i32 = -14;
pub const MORE_RESULTS_TO_RETURN: i32 = -15;
pub const CLIENT_LOOP: i32 = -16;
pub const REFERRAL_LIMIT_EXCEEDED: i32 = -17;
pub const X_CONNECTING: i32 = -18;

/// Render a result code as text, the way `ldap_err2string` does.
pub fn err2string(code: i32) -> &'static str {
    match code {
        SUCCESS => "Success",
        OPERATIONS_ERROR => "Operations error",
        PROTOCOL_ERROR => "Protocol error",
        TIME_LIMIT_EXCEEDED => "Time limit exceeded",
        SIZE_LIMIT_EXCEEDED => "Size limit exceeded",
        COMPARE_FALSE => "Compare False",
        COMPARE_TRUE => "Compare True",
        AUTH_METHOD_NOT_SUPPORTED => "Authentication method not supported",
        STRONGER_AUTH_REQUIRED => "Strong(er) authentication required",
        PARTIAL_RESULTS => "Partial results and referral received",
        REFERRAL => "Referral",
        ADMIN_LIMIT_EXCEEDED => "Administrative limit exceeded",
        UNAVAILABLE_CRITICAL_EXTENSION => "Critical extension is unavailable",
        CONFIDENTIALITY_REQUIRED => "Confidentiality required",
        SASL_BIND_IN_PROGRESS => "SASL bind in progress",
        NO_SUCH_ATTRIBUTE => "No such attribute",
        UNDEFINED_TYPE => "Undefined attribute type",
        INAPPROPRIATE_MATCHING => "Inappropriate matching",
        CONSTRAINT_VIOLATION => "Constraint violation",
        TYPE_OR_VALUE_EXISTS => "Type or value exists",
        INVALID_SYNTAX => "Invalid syntax",
        NO_SUCH_OBJECT => "No such object",
        ALIAS_PROBLEM => "Alias problem",
        INVALID_DN_SYNTAX => "Invalid DN syntax",
        IS_LEAF => "Entry is a leaf",
        ALIAS_DEREF_PROBLEM => "Alias dereferencing problem",
        PROXY_AUTHZ_FAILURE => "Proxy Authorization Failure",
        INAPPROPRIATE_AUTH => "Inappropriate authentication",
        INVALID_CREDENTIALS => "Invalid credentials",
        INSUFFICIENT_ACCESS => "Insufficient access",
        BUSY => "Server is busy",
        UNAVAILABLE => "Server is unavailable",
        UNWILLING_TO_PERFORM => "Server is unwilling to perform",
        LOOP_DETECT => "Loop detected",
        NAMING_VIOLATION => "Naming violation",
        OBJECT_CLASS_VIOLATION => "Object class violation",
        NOT_ALLOWED_ON_NONLEAF => "Operation not allowed on non-leaf",
        NOT_ALLOWED_ON_RDN => "Operation not allowed on RDN",
        ALREADY_EXISTS => "Already exists",
        NO_OBJECT_CLASS_MODS => "Cannot modify object class",
        RESULTS_TOO_LARGE => "Results too large",
        AFFECTS_MULTIPLE_DSAS => "Operation affects multiple DSAs",
        VLV_ERROR => "Virtual List View error",
        OTHER => "Other (e.g., implementation specific) error",
        CANCELLED => "Cancelled",
        NO_SUCH_OPERATION => "No such operation",
        TOO_LATE => "Too Late to Cancel",
        CANNOT_CANCEL => "Cannot Cancel",
        ASSERTION_FAILED => "Assertion Failed",
        PROXIED_AUTHORIZATION_DENIED => "Proxied Authorization Denied",
        SYNC_REFRESH_REQUIRED => "Sync refresh required",

        SERVER_DOWN => "Can't contact LDAP server",
        LOCAL_ERROR => "Local error",
        ENCODING_ERROR => "Encoding error",
        DECODING_ERROR => "Decoding error",
        TIMEOUT => "Timed out",
        AUTH_UNKNOWN => "Unknown authentication method",
        FILTER_ERROR => "Bad search filter",
        USER_CANCELLED => "User cancelled operation",
        PARAM_ERROR => "Bad parameter to an ldap routine",
        NO_MEMORY => "Out of memory",
        CONNECT_ERROR => "Connect error",
        NOT_SUPPORTED => "Not Supported",
        CONTROL_NOT_FOUND => "Control not found",
        NO_RESULTS_RETURNED => "No results returned",
        MORE_RESULTS_TO_RETURN => "More results to return",
        CLIENT_LOOP => "Client Loop",
        REFERRAL_LIMIT_EXCEEDED => "Referral Limit Exceeded",
        X_CONNECTING => "Connecting (X)",
        _ => "Unknown error",
    }
}
