// SPDX-License-Identifier: MPL-2.0

pub(crate) use alloc::{
    collections::BTreeMap,
    format,
    string::String,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::fmt::{self, Debug};

pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::{
    block_cache::BlockCache,
    block_ptr::BlockId,
    error::{Errno::*, Error},
    return_errno, return_errno_with_msg,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;
