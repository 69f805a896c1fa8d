//  Copyright (c) 2024 SurrealDB Ltd.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Block-framed record log.
//!
//! One framing serves two consumers: the bundled LSM engine's
//! write-ahead log and the value-log manifest. Records are packed into
//! 32 KiB blocks behind a CRC+length+type header and fragmented across
//! blocks when needed; a torn tail after a crash truncates replay
//! instead of failing it.

mod file_writer;
mod format;
mod reader;
mod writer;

pub(crate) use file_writer::BufferedFileWriter;
pub(crate) use format::{RecordType, BLOCK_SIZE, HEADER_SIZE};
pub(crate) use reader::Reader;
pub(crate) use writer::Writer;
