//! Engine-side protocol glue.
//!
//! Everything the host injects into the engine lives here as data: the
//! bootstrap snippet defining the engine-side helper functions, the
//! sentinel flag constants, and the small generated statements the
//! pipeline appends to submitted code. Keeping the snippets in one place
//! keeps the wire protocol reviewable without chasing string construction
//! through the pipeline.
//!
//! # Protocol constants
//!
//! The engine-side helpers mirror the host codec exactly:
//!
//! ```text
//! tag  -2  NotFound      -1  Unknown       0  Logical
//!       1  Integer        2  Double        3  Character
//!       4  Matrix
//! ```
//!
//! Every value is `[tag: int32][length: int32][payload]`; see
//! [`crate::wire`] for the payload layouts.

use crate::config::Endian;

/// Version of the engine-side helper set. Written by the engine as the
/// first word on the data channel after dialing back; the host refuses the
/// session on mismatch.
pub const PROTOCOL_VERSION: i32 = 1;

/// Marker printed by generated glue to signal eval completion. The line
/// observed on the text channel carries the quoted form plus the run
/// counter: `[1] "RBRIDGE_EVAL_FLAG.<counter>"`.
pub const EVAL_FLAG: &str = "RBRIDGE_EVAL_FLAG";

/// Marker printed by the engine's shutdown hook when it exits on its own
/// (for example user code calling `q()`).
pub const EXIT_FLAG: &str = "RBRIDGE_EXIT_FLAG";

/// Prefix on diverted message-stream lines when stderr echoing is active.
pub const STDERR_FLAG: &str = "RBRIDGE_STDERR_FLAG";

/// Clean-exit directive written to the text channel by `terminate`.
pub const EXIT_DIRECTIVE: &str = "q(save = \"no\")";

/// The bootstrap snippet sent once at session start, before any user code.
///
/// Defines the data-channel connection slot, the read/write half of the
/// wire codec, the parse probe, and the guarded assignability check. The
/// `%ENDIAN%` placeholder is substituted at launch.
const BOOTSTRAP_TEMPLATE: &str = r#"
rbridge.env <- new.env()
rbridge.endian <- "%ENDIAN%"

rbridge.connect <- function(host, port) {
  con <- socketConnection(host = host, port = port, blocking = TRUE,
                          open = "r+b", timeout = 2592000)
  assign("con", con, envir = rbridge.env)
  writeBin(1L, con, size = 4, endian = rbridge.endian)
  flush(con)
  invisible(NULL)
}

rbridge.disconnect <- function() {
  if (exists("con", envir = rbridge.env)) {
    try(close(get("con", envir = rbridge.env)), silent = TRUE)
    rm("con", envir = rbridge.env)
  }
  invisible(NULL)
}

rbridge.con <- function() get("con", envir = rbridge.env)

rbridge.write.ints <- function(v) {
  writeBin(as.integer(v), rbridge.con(), size = 4, endian = rbridge.endian)
}

rbridge.read.ints <- function(n) {
  readBin(rbridge.con(), "integer", n = n, size = 4, endian = rbridge.endian)
}

rbridge.write.value <- function(v) {
  con <- rbridge.con()
  if (is.matrix(v)) {
    rbridge.write.ints(c(4L, length(v), nrow(v), ncol(v)))
    rbridge.write.body(as.vector(t(v)))
  } else {
    rbridge.write.body(v)
  }
  flush(con)
}

rbridge.write.body <- function(v) {
  con <- rbridge.con()
  if (is.logical(v)) {
    rbridge.write.ints(c(0L, length(v)))
    rbridge.write.ints(as.integer(v))
  } else if (is.integer(v)) {
    rbridge.write.ints(c(1L, length(v)))
    rbridge.write.ints(v)
  } else if (is.double(v)) {
    rbridge.write.ints(c(2L, length(v)))
    writeBin(as.double(v), con, size = 8, endian = rbridge.endian)
    na <- which(is.na(v) & !is.nan(v)) - 1L
    rbridge.write.ints(length(na))
    if (length(na) > 0) rbridge.write.ints(na)
  } else if (is.character(v)) {
    rbridge.write.ints(c(3L, length(v)))
    for (s in v) {
      if (is.na(s)) {
        rbridge.write.ints(-1L)
      } else {
        b <- charToRaw(enc2utf8(s))
        rbridge.write.ints(length(b))
        writeBin(b, con)
      }
    }
  } else {
    cls <- paste(class(v), collapse = "/")
    b <- charToRaw(enc2utf8(cls))
    rbridge.write.ints(c(-1L, length(b)))
    writeBin(b, con)
  }
}

rbridge.read.value <- function() {
  header <- rbridge.read.ints(2)
  tag <- header[1]
  n <- header[2]
  if (tag == 0L) {
    as.logical(rbridge.read.ints(n))
  } else if (tag == 1L) {
    rbridge.read.ints(n)
  } else if (tag == 2L) {
    v <- readBin(rbridge.con(), "double", n = n, size = 8, endian = rbridge.endian)
    missing <- rbridge.read.ints(1)
    if (missing > 0) v[rbridge.read.ints(missing) + 1L] <- NA
    v
  } else if (tag == 3L) {
    v <- character(n)
    for (i in seq_len(n)) {
      len <- rbridge.read.ints(1)
      if (len < 0L) {
        v[i] <- NA
      } else if (len == 0L) {
        v[i] <- ""
      } else {
        v[i] <- rawToChar(readBin(rbridge.con(), "raw", n = len))
      }
    }
    v
  } else if (tag == 4L) {
    dims <- rbridge.read.ints(2)
    matrix(rbridge.read.value(), nrow = dims[1], ncol = dims[2], byrow = TRUE)
  } else {
    stop(paste("rbridge: unknown wire tag", tag))
  }
}

rbridge.send <- function(x) {
  if (inherits(x, "try-error")) {
    rbridge.write.ints(c(-2L, 0L))
    flush(rbridge.con())
  } else {
    rbridge.write.value(x)
  }
  invisible(NULL)
}

rbridge.probe <- function() {
  code <- rbridge.read.value()
  msg <- tryCatch({ parse(text = code); NULL },
                  error = function(e) conditionMessage(e))
  if (is.null(msg)) {
    rbridge.write.value(c(1L, 0L, 0L))
    rbridge.write.value("")
  } else {
    pos <- regmatches(msg, regexec("<text>:([0-9]+):([0-9]+):", msg))[[1]]
    line <- if (length(pos) == 3) as.integer(pos[2]) else 0L
    col <- if (length(pos) == 3) as.integer(pos[3]) else 0L
    status <- if (grepl("unexpected end of input", msg, fixed = TRUE)) 0L else -1L
    rbridge.write.value(c(status, line, col))
    rbridge.write.value(msg)
  }
  invisible(NULL)
}

rbridge.assignable <- function() {
  code <- rbridge.read.value()
  ok <- tryCatch({
    eval(parse(text = code), envir = new.env(parent = globalenv()))
    TRUE
  }, error = function(e) FALSE)
  rbridge.write.value(ok)
  invisible(NULL)
}

.Last <- function() try(print("RBRIDGE_EXIT_FLAG"), silent = TRUE)
"#;

/// Snippet diverting the engine's message stream onto stdout, each line
/// prefixed with [`STDERR_FLAG`] so the pipeline can route it separately.
/// Sent at bootstrap only when `echo_stderr` is enabled.
const STDERR_DIVERT: &str = r#"
globalCallingHandlers(
  warning = function(w) {
    cat(paste0("RBRIDGE_STDERR_FLAG ", conditionMessage(w), "\n"))
    invokeRestart("muffleWarning")
  },
  message = function(m) {
    cat(paste0("RBRIDGE_STDERR_FLAG ", conditionMessage(m)))
    invokeRestart("muffleMessage")
  }
)
"#;

fn endian_keyword(endian: Endian) -> &'static str {
    match endian {
        Endian::Big => "big",
        Endian::Little => "little",
    }
}

/// Render the bootstrap snippet for the session's byte order.
pub fn bootstrap(endian: Endian, echo_stderr: bool) -> String {
    let mut code = BOOTSTRAP_TEMPLATE.replace("%ENDIAN%", endian_keyword(endian));
    if echo_stderr {
        code.push_str(STDERR_DIVERT);
    }
    code
}

/// Statement instructing the engine to dial the host listener.
pub fn dial_statement(host: &str, port: u16) -> String {
    format!("rbridge.connect(\"{host}\", {port})")
}

/// Statement printing the completion sentinel for one eval run.
pub fn sentinel_statement(counter: u64) -> String {
    format!("print(\"{EVAL_FLAG}.{counter}\")")
}

/// The full line the engine prints for [`sentinel_statement`] output.
pub fn sentinel_line(counter: u64) -> String {
    format!("[1] \"{EVAL_FLAG}.{counter}\"")
}

/// Prefix shared by every eval sentinel line regardless of run counter.
/// A line with this prefix but the wrong counter is a stale sentinel from
/// an abandoned call.
pub fn sentinel_prefix() -> String {
    format!("[1] \"{EVAL_FLAG}.")
}

/// The line the engine's shutdown hook prints when it exits on its own.
pub fn exit_line() -> String {
    format!("[1] \"{EXIT_FLAG}\"")
}

/// Statement assigning the next value read off the data channel to `name`.
pub fn assign_statement(name: &str) -> String {
    format!("invisible({name} <- rbridge.read.value())")
}

/// Statement serializing the value of `expr` onto the data channel.
/// `try` keeps lookup failures on the engine side as a `NotFound` answer
/// instead of an error dump on the text channel.
pub fn pull_statement(expr: &str) -> String {
    format!("rbridge.send(try({expr}, silent = TRUE))")
}

/// Statement invoking the engine-side parse probe.
pub fn probe_statement() -> String {
    "rbridge.probe()".to_string()
}

/// Statement invoking the engine-side guarded assignability check.
pub fn assignable_statement() -> String {
    "rbridge.assignable()".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_substitutes_endian() {
        let big = bootstrap(Endian::Big, false);
        assert!(big.contains("rbridge.endian <- \"big\""));
        assert!(!big.contains("%ENDIAN%"));

        let little = bootstrap(Endian::Little, false);
        assert!(little.contains("rbridge.endian <- \"little\""));
    }

    #[test]
    fn test_bootstrap_stderr_divert_is_optional() {
        assert!(!bootstrap(Endian::Big, false).contains("globalCallingHandlers"));
        assert!(bootstrap(Endian::Big, true).contains("globalCallingHandlers"));
    }

    #[test]
    fn test_generated_statements() {
        assert_eq!(
            dial_statement("127.0.0.1", 38442),
            "rbridge.connect(\"127.0.0.1\", 38442)"
        );
        assert_eq!(
            sentinel_statement(7),
            "print(\"RBRIDGE_EVAL_FLAG.7\")"
        );
        assert_eq!(sentinel_line(7), "[1] \"RBRIDGE_EVAL_FLAG.7\"");
        assert!(sentinel_line(7).starts_with(&sentinel_prefix()));
        assert_eq!(exit_line(), "[1] \"RBRIDGE_EXIT_FLAG\"");
        assert_eq!(
            assign_statement("x"),
            "invisible(x <- rbridge.read.value())"
        );
        assert_eq!(
            pull_statement("x$y"),
            "rbridge.send(try(x$y, silent = TRUE))"
        );
    }

    #[test]
    fn test_flags_are_distinct() {
        // The eval flag must never be a prefix of the exit flag or vice
        // versa, or the line classifier could confuse them.
        assert!(!EVAL_FLAG.starts_with(EXIT_FLAG));
        assert!(!EXIT_FLAG.starts_with(EVAL_FLAG));
        assert!(!STDERR_FLAG.starts_with(EVAL_FLAG));
    }
}
