//! End-to-end tests of the pipe queue against the SQLite adapter.
//! All test code lives under `tests/`.
