//! Tests for the sideloader, split by domain the way the methods are:
//! lifecycle control, queue operations, installation entry points and the
//! pipeline driver itself.

use super::test_helpers::*;
use super::*;
