//! C ABI surface for embedding teilen-sql into a host shell (mobile apps,
//! desktop wrappers). Complex payloads cross the boundary as JSON strings;
//! scalars and handles cross as plain C types. Errors are reported via a
//! thread-local last-error slot rather than out-parameters, mirroring how
//! the rest of this crate keeps the core free of transport concerns.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};

use rusqlite::Connection;
use serde::Deserialize;

use crate::applier::Resolution;
use crate::engine::TeilenEngine;
use crate::schema::CrrTableOptions;

/// Opaque handle owning a SQLite connection.
pub struct TeilenConnHandle {
    conn: Connection,
}

thread_local! {
    static LAST_ERROR: RefCell<(i32, String)> = RefCell::new((0, String::new()));
}

fn set_last_error(code: i32, msg: &str) {
    LAST_ERROR.with(|le| *le.borrow_mut() = (code, msg.to_string()));
}
fn clear_last_error() {
    LAST_ERROR.with(|le| *le.borrow_mut() = (0, String::new()));
}

fn ptr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, ()> {
    if ptr.is_null() {
        return Err(());
    }
    unsafe { CStr::from_ptr(ptr).to_str().map_err(|_| ()) }
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s).map(|cs| cs.into_raw()).unwrap_or(std::ptr::null_mut())
}

/// Free a C string previously returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn teilen_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}

/// Open a SQLite connection. `path` may be a file path or `:memory:`.
/// Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn teilen_open(path: *const c_char) -> *mut TeilenConnHandle {
    let path = match ptr_to_str(path) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid path");
            return std::ptr::null_mut();
        }
    };
    match Connection::open(path) {
        Ok(conn) => {
            clear_last_error();
            Box::into_raw(Box::new(TeilenConnHandle { conn }))
        }
        Err(e) => {
            set_last_error(1, &format!("sqlite: {e}"));
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_close(handle: *mut TeilenConnHandle) {
    if handle.is_null() {
        return;
    }
    unsafe {
        let _ = Box::from_raw(handle);
    }
}

macro_rules! with_engine {
    ($handle:expr, $err_ret:expr, |$engine:ident| $body:expr) => {{
        let h = unsafe { $handle.as_ref() };
        let Some(h) = h else {
            set_last_error(4, "null handle");
            return $err_ret;
        };
        let $engine = match TeilenEngine::open(&h.conn) {
            Ok(e) => e,
            Err(e) => {
                set_last_error(1, &format!("{e}"));
                return $err_ret;
            }
        };
        $body
    }};
}

fn parse_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, ()> {
    serde_json::from_str(s).map_err(|_| ())
}

/// Install bookkeeping tables and resolve (or generate) this replica's site
/// identity. Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn teilen_init_schema(handle: *mut TeilenConnHandle) -> c_int {
    with_engine!(handle, 1, |_engine| {
        clear_last_error();
        0
    })
}

/// `manual_columns_json` is a JSON array of column names, or null for none.
#[unsafe(no_mangle)]
pub extern "C" fn teilen_upgrade_table_to_crr(
    handle: *mut TeilenConnHandle,
    table: *const c_char,
    manual_columns_json: *const c_char,
) -> c_int {
    let table = match ptr_to_str(table) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid table");
            return 3;
        }
    };
    let manual_columns: Vec<String> = if manual_columns_json.is_null() {
        Vec::new()
    } else {
        match ptr_to_str(manual_columns_json).ok().and_then(|s| parse_json(s).ok()) {
            Some(v) => v,
            None => {
                set_last_error(4, "invalid manual_columns_json");
                return 3;
            }
        }
    };
    with_engine!(handle, 1, |engine| {
        match engine.upgrade_table_to_crr(table, &CrrTableOptions { manual_columns }) {
            Ok(()) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(1, &format!("{e}"));
                1
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_upgrade_all_tables_to_crr(handle: *mut TeilenConnHandle) -> c_int {
    with_engine!(handle, 1, |engine| match engine.upgrade_all_tables_to_crr() {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            1
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_upgrade_column_to_fractional_index(
    handle: *mut TeilenConnHandle,
    table: *const c_char,
    column: *const c_char,
    parent_column: *const c_char,
) -> c_int {
    let (table, column, parent_column) = match (ptr_to_str(table), ptr_to_str(column), ptr_to_str(parent_column)) {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        _ => {
            set_last_error(4, "invalid arguments");
            return 3;
        }
    };
    with_engine!(handle, 1, |engine| {
        match engine.upgrade_column_to_fractional_index(table, column, parent_column) {
            Ok(()) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(1, &format!("{e}"));
                1
            }
        }
    })
}

/// Install row triggers on every upgraded table. Must run once after the
/// user schema exists.
#[unsafe(no_mangle)]
pub extern "C" fn teilen_finalize_schema(handle: *mut TeilenConnHandle) -> c_int {
    with_engine!(handle, 1, |engine| match engine.finalize_schema() {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            1
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_insert_row(
    handle: *mut TeilenConnHandle,
    document_id: *const c_char,
    table: *const c_char,
    row_json: *const c_char,
) -> c_int {
    let (document_id, table, row_json) = match (ptr_to_str(document_id), ptr_to_str(table), ptr_to_str(row_json)) {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        _ => {
            set_last_error(4, "invalid arguments");
            return 3;
        }
    };
    let row: serde_json::Map<String, serde_json::Value> = match parse_json(row_json) {
        Ok(v) => v,
        Err(_) => {
            set_last_error(4, "invalid row_json");
            return 3;
        }
    };
    with_engine!(handle, 1, |engine| match engine.insert_row(document_id, table, &row) {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            1
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_update_row(
    handle: *mut TeilenConnHandle,
    document_id: *const c_char,
    table: *const c_char,
    pk_columns_json: *const c_char,
    pk_values_json: *const c_char,
    changes_json: *const c_char,
) -> c_int {
    let strs = (
        ptr_to_str(document_id),
        ptr_to_str(table),
        ptr_to_str(pk_columns_json),
        ptr_to_str(pk_values_json),
        ptr_to_str(changes_json),
    );
    let (document_id, table, pk_columns_json, pk_values_json, changes_json) = match strs {
        (Ok(a), Ok(b), Ok(c), Ok(d), Ok(e)) => (a, b, c, d, e),
        _ => {
            set_last_error(4, "invalid arguments");
            return 3;
        }
    };
    let (pk_columns, pk_values, changes): (Vec<String>, Vec<serde_json::Value>, serde_json::Map<String, serde_json::Value>) =
        match (parse_json(pk_columns_json), parse_json(pk_values_json), parse_json(changes_json)) {
            (Ok(a), Ok(b), Ok(c)) => (a, b, c),
            _ => {
                set_last_error(4, "invalid json payload");
                return 3;
            }
        };
    with_engine!(handle, 1, |engine| {
        match engine.update_row(document_id, table, &pk_columns, &pk_values, &changes) {
            Ok(()) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(1, &format!("{e}"));
                1
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_delete_row(
    handle: *mut TeilenConnHandle,
    document_id: *const c_char,
    table: *const c_char,
    pk_columns_json: *const c_char,
    pk_values_json: *const c_char,
) -> c_int {
    let strs = (ptr_to_str(document_id), ptr_to_str(table), ptr_to_str(pk_columns_json), ptr_to_str(pk_values_json));
    let (document_id, table, pk_columns_json, pk_values_json) = match strs {
        (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
        _ => {
            set_last_error(4, "invalid arguments");
            return 3;
        }
    };
    let (pk_columns, pk_values): (Vec<String>, Vec<serde_json::Value>) = match (parse_json(pk_columns_json), parse_json(pk_values_json)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => {
            set_last_error(4, "invalid json payload");
            return 3;
        }
    };
    with_engine!(handle, 1, |engine| match engine.delete_row(document_id, table, &pk_columns, &pk_values) {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            1
        }
    })
}

/// Returns the new commit as a JSON string, or null if there was nothing
/// pending (check `teilen_last_error_code`).
#[unsafe(no_mangle)]
pub extern "C" fn teilen_commit(handle: *mut TeilenConnHandle, document_id: *const c_char, message: *const c_char) -> *mut c_char {
    let (document_id, message) = match (ptr_to_str(document_id), ptr_to_str(message)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => {
            set_last_error(4, "invalid arguments");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.commit(document_id, message) {
        Ok(c) => match serde_json::to_string(&c) {
            Ok(s) => {
                clear_last_error();
                to_cstring_ptr(&s)
            }
            Err(e) => {
                set_last_error(2, &format!("{e}"));
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_checkout(handle: *mut TeilenConnHandle, document_id: *const c_char, commit_id: *const c_char) -> c_int {
    let (document_id, commit_id) = match (ptr_to_str(document_id), ptr_to_str(commit_id)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => {
            set_last_error(4, "invalid arguments");
            return 3;
        }
    };
    with_engine!(handle, 1, |engine| match engine.checkout(document_id, commit_id) {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            1
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_get_document_snapshot(handle: *mut TeilenConnHandle, commit_id: *const c_char) -> *mut c_char {
    let commit_id = match ptr_to_str(commit_id) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid commit_id");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.get_document_snapshot(commit_id) {
        Ok(snap) => match serde_json::to_string(&snap) {
            Ok(s) => {
                clear_last_error();
                to_cstring_ptr(&s)
            }
            Err(e) => {
                set_last_error(2, &format!("{e}"));
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_render_commit_graph(handle: *mut TeilenConnHandle, document_id: *const c_char) -> *mut c_char {
    let document_id = match ptr_to_str(document_id) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid document_id");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.render_commit_graph(document_id) {
        Ok(s) => {
            clear_last_error();
            to_cstring_ptr(&s)
        }
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

/// Apply a JSON array of `Change` objects. Returns the newly surfaced
/// conflicts (possibly empty `[]`) as JSON, or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn teilen_apply_changes(handle: *mut TeilenConnHandle, changes_json: *const c_char) -> *mut c_char {
    let changes_json = match ptr_to_str(changes_json) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid changes_json");
            return std::ptr::null_mut();
        }
    };
    let changes: Vec<crate::change::Change> = match parse_json(changes_json) {
        Ok(v) => v,
        Err(_) => {
            set_last_error(4, "invalid changes_json payload");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.apply_changes(&changes) {
        Ok(conflicts) => match serde_json::to_string(&conflicts) {
            Ok(s) => {
                clear_last_error();
                to_cstring_ptr(&s)
            }
            Err(e) => {
                set_last_error(2, &format!("{e}"));
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_get_conflicts(handle: *mut TeilenConnHandle, table: *const c_char) -> *mut c_char {
    let table = match ptr_to_str(table) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid table");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.get_conflicts(table) {
        Ok(conflicts) => match serde_json::to_string(&conflicts) {
            Ok(s) => {
                clear_last_error();
                to_cstring_ptr(&s)
            }
            Err(e) => {
                set_last_error(2, &format!("{e}"));
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

#[derive(Deserialize)]
#[serde(tag = "choice", content = "value", rename_all = "lowercase")]
enum ResolutionDto {
    Ours,
    Theirs,
    Value(serde_json::Value),
}

impl From<ResolutionDto> for Resolution {
    fn from(d: ResolutionDto) -> Self {
        match d {
            ResolutionDto::Ours => Resolution::Ours,
            ResolutionDto::Theirs => Resolution::Theirs,
            ResolutionDto::Value(v) => Resolution::Value(v),
        }
    }
}

/// `resolution_json` is `{"choice":"ours"}`, `{"choice":"theirs"}` or
/// `{"choice":"value","value":<json>}`.
#[unsafe(no_mangle)]
pub extern "C" fn teilen_resolve_conflict(
    handle: *mut TeilenConnHandle,
    table: *const c_char,
    pk: *const c_char,
    document_id: *const c_char,
    column: *const c_char,
    resolution_json: *const c_char,
) -> c_int {
    let strs = (ptr_to_str(table), ptr_to_str(pk), ptr_to_str(document_id), ptr_to_str(column), ptr_to_str(resolution_json));
    let (table, pk, document_id, column, resolution_json) = match strs {
        (Ok(a), Ok(b), Ok(c), Ok(d), Ok(e)) => (a, b, c, d, e),
        _ => {
            set_last_error(4, "invalid arguments");
            return 3;
        }
    };
    let resolution: ResolutionDto = match parse_json(resolution_json) {
        Ok(v) => v,
        Err(_) => {
            set_last_error(4, "invalid resolution_json");
            return 3;
        }
    };
    with_engine!(handle, 1, |engine| {
        match engine.resolve_conflict(table, pk, document_id, column, resolution.into()) {
            Ok(()) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(1, &format!("{e}"));
                1
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_prepare_push_commits(handle: *mut TeilenConnHandle, document_id: *const c_char) -> *mut c_char {
    let document_id = match ptr_to_str(document_id) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid document_id");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.prepare_push_commits(document_id) {
        Ok(req) => match serde_json::to_string(&req) {
            Ok(s) => {
                clear_last_error();
                to_cstring_ptr(&s)
            }
            Err(e) => {
                set_last_error(2, &format!("{e}"));
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_receive_push_commits(handle: *mut TeilenConnHandle, request_json: *const c_char) -> *mut c_char {
    let request_json = match ptr_to_str(request_json) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid request_json");
            return std::ptr::null_mut();
        }
    };
    let req: crate::commit::PushRequest = match parse_json(request_json) {
        Ok(v) => v,
        Err(_) => {
            set_last_error(4, "invalid request_json payload");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.receive_push_commits(&req) {
        Ok(resp) => match serde_json::to_string(&resp) {
            Ok(s) => {
                clear_last_error();
                to_cstring_ptr(&s)
            }
            Err(e) => {
                set_last_error(2, &format!("{e}"));
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_mark_pushed(handle: *mut TeilenConnHandle, document_id: *const c_char, head: *const c_char) -> c_int {
    let (document_id, head) = match (ptr_to_str(document_id), ptr_to_str(head)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => {
            set_last_error(4, "invalid arguments");
            return 3;
        }
    };
    with_engine!(handle, 1, |engine| match engine.mark_pushed(document_id, head) {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            1
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_prepare_pull_commits(handle: *mut TeilenConnHandle, document_id: *const c_char) -> *mut c_char {
    let document_id = match ptr_to_str(document_id) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid document_id");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.prepare_pull_commits(document_id) {
        Ok(req) => match serde_json::to_string(&req) {
            Ok(s) => {
                clear_last_error();
                to_cstring_ptr(&s)
            }
            Err(e) => {
                set_last_error(2, &format!("{e}"));
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_receive_pull_commits(handle: *mut TeilenConnHandle, request_json: *const c_char) -> *mut c_char {
    let request_json = match ptr_to_str(request_json) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid request_json");
            return std::ptr::null_mut();
        }
    };
    let req: crate::sync::PullRequest = match parse_json(request_json) {
        Ok(v) => v,
        Err(_) => {
            set_last_error(4, "invalid request_json payload");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.receive_pull_commits(&req) {
        Ok(resp) => match serde_json::to_string(&resp) {
            Ok(s) => {
                clear_last_error();
                to_cstring_ptr(&s)
            }
            Err(e) => {
                set_last_error(2, &format!("{e}"));
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn teilen_apply_pull(handle: *mut TeilenConnHandle, response_json: *const c_char) -> *mut c_char {
    let response_json = match ptr_to_str(response_json) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid response_json");
            return std::ptr::null_mut();
        }
    };
    let resp: crate::sync::PullResponse = match parse_json(response_json) {
        Ok(v) => v,
        Err(_) => {
            set_last_error(4, "invalid response_json payload");
            return std::ptr::null_mut();
        }
    };
    with_engine!(handle, std::ptr::null_mut(), |engine| match engine.apply_pull(&resp) {
        Ok(result) => match serde_json::to_string(&result) {
            Ok(s) => {
                clear_last_error();
                to_cstring_ptr(&s)
            }
            Err(e) => {
                set_last_error(2, &format!("{e}"));
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("{e}"));
            std::ptr::null_mut()
        }
    })
}

/// Last error code for the current thread (0 = none).
#[unsafe(no_mangle)]
pub extern "C" fn teilen_last_error_code() -> c_int {
    LAST_ERROR.with(|le| le.borrow().0)
}

/// Last error message for the current thread as a newly allocated C
/// string. Caller must free with `teilen_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn teilen_last_error_message() -> *mut c_char {
    to_cstring_ptr(&LAST_ERROR.with(|le| le.borrow().1.clone()))
}
