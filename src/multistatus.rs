//! PROPFIND 的 207 Multi-Status 响应体。

use httpdate::fmt_http_date;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::io::Write;
use xml::EmitterConfig;
use xml::writer::{EventWriter, XmlEvent};

use crate::storage::FileEntry;

// RFC 3986 路径段中需要转义的字符
const HREF_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/');

#[derive(Debug)]
pub struct DavResource {
    href: String,
    display_name: String,
    is_collection: bool,
    content_length: u64,
    content_type: Option<String>,
    last_modified: Option<String>,
    etag: Option<String>,
}

impl DavResource {
    /// 由目录条目生成；集合的 href 以 `/` 结尾。
    pub fn from_entry(mount: &str, entry: &FileEntry, etag: Option<String>) -> Self {
        let mut href = mount.to_string();
        for segment in entry.path.split('/').filter(|segment| !segment.is_empty()) {
            href.push('/');
            href.extend(utf8_percent_encode(segment, HREF_SEGMENT));
        }
        if entry.is_dir {
            href.push('/');
        }
        let content_type = (!entry.is_dir).then(|| {
            mime_guess::from_path(&entry.name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });
        Self {
            href,
            display_name: entry.name.clone(),
            is_collection: entry.is_dir,
            content_length: entry.size,
            content_type,
            last_modified: entry.modified.map(fmt_http_date),
            etag,
        }
    }
}

pub fn render(resources: &[DavResource]) -> Result<Vec<u8>, xml::writer::Error> {
    let mut buffer = Vec::new();
    {
        let mut writer = EmitterConfig::new()
            .perform_indent(true)
            .create_writer(&mut buffer);
        writer.write(XmlEvent::start_element("D:multistatus").ns("D", "DAV:"))?;
        for resource in resources {
            write_response(&mut writer, resource)?;
        }
        writer.write(XmlEvent::end_element())?;
    }
    Ok(buffer)
}

fn write_response<W: Write>(
    writer: &mut EventWriter<W>,
    resource: &DavResource,
) -> Result<(), xml::writer::Error> {
    writer.write(XmlEvent::start_element("D:response"))?;
    text_element(writer, "D:href", &resource.href)?;
    writer.write(XmlEvent::start_element("D:propstat"))?;
    writer.write(XmlEvent::start_element("D:prop"))?;

    text_element(writer, "D:displayname", &resource.display_name)?;
    writer.write(XmlEvent::start_element("D:resourcetype"))?;
    if resource.is_collection {
        writer.write(XmlEvent::start_element("D:collection"))?;
        writer.write(XmlEvent::end_element())?;
    }
    writer.write(XmlEvent::end_element())?;
    if !resource.is_collection {
        text_element(
            writer,
            "D:getcontentlength",
            &resource.content_length.to_string(),
        )?;
    }
    if let Some(content_type) = &resource.content_type {
        text_element(writer, "D:getcontenttype", content_type)?;
    }
    if let Some(last_modified) = &resource.last_modified {
        text_element(writer, "D:getlastmodified", last_modified)?;
    }
    if let Some(etag) = &resource.etag {
        text_element(writer, "D:getetag", etag)?;
    }

    writer.write(XmlEvent::end_element())?; // prop
    text_element(writer, "D:status", "HTTP/1.1 200 OK")?;
    writer.write(XmlEvent::end_element())?; // propstat
    writer.write(XmlEvent::end_element()) // response
}

fn text_element<W: Write>(
    writer: &mut EventWriter<W>,
    name: &str,
    value: &str,
) -> Result<(), xml::writer::Error> {
    writer.write(XmlEvent::start_element(name))?;
    writer.write(XmlEvent::characters(value))?;
    writer.write(XmlEvent::end_element())
}
